use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::AutoscanError;

/// A single path-rewrite rule. `from` is a regular expression, `to` is its
/// replacement template and may reference capture groups positionally.
#[derive(Debug, Clone, Deserialize)]
pub struct Rewrite {
    pub from: String,
    pub to: String,
}

/// Rewrites paths with an ordered rule list: the first rule whose pattern
/// matches anywhere in the input wins, and every occurrence of that pattern
/// is replaced. Inputs matching no rule pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct Rewriter {
    rules: Arc<Vec<(Regex, String)>>,
}

impl Rewriter {
    pub fn new(rewrites: &[Rewrite]) -> Result<Self, AutoscanError> {
        let mut rules = Vec::with_capacity(rewrites.len());

        for rewrite in rewrites {
            let re = Regex::new(&rewrite.from).map_err(|err| {
                AutoscanError::Config(format!("invalid rewrite pattern {:?}: {err}", rewrite.from))
            })?;

            rules.push((re, rewrite.to.clone()));
        }

        Ok(Self { rules: Arc::new(rules) })
    }

    pub fn rewrite(&self, input: &str) -> String {
        for (re, to) in self.rules.iter() {
            if re.is_match(input) {
                return re.replace_all(input, to.as_str()).into_owned();
            }
        }

        input.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter(rules: &[(&str, &str)]) -> Rewriter {
        let rewrites: Vec<Rewrite> = rules
            .iter()
            .map(|(from, to)| Rewrite {
                from: (*from).to_owned(),
                to: (*to).to_owned(),
            })
            .collect();

        Rewriter::new(&rewrites).expect("rules should compile")
    }

    #[test]
    fn no_rules_is_identity() {
        let rw = Rewriter::new(&[]).unwrap();
        assert_eq!(rw.rewrite("/Media/Movies"), "/Media/Movies");
    }

    #[test]
    fn replaces_matched_prefix() {
        let rw = rewriter(&[("^/TV/", "/mnt/unionfs/Media/TV/")]);
        assert_eq!(
            rw.rewrite("/TV/Westworld/Season 1"),
            "/mnt/unionfs/Media/TV/Westworld/Season 1"
        );
    }

    #[test]
    fn capture_groups_are_substituted() {
        let rw = rewriter(&[("^/downloads/(tv|movies)/", "/mnt/media/$1/")]);
        assert_eq!(rw.rewrite("/downloads/tv/show"), "/mnt/media/tv/show");
        assert_eq!(rw.rewrite("/downloads/movies/film"), "/mnt/media/movies/film");
    }

    #[test]
    fn first_matching_rule_wins() {
        let rw = rewriter(&[("^/a/", "/one/"), ("^/a/b/", "/two/")]);
        assert_eq!(rw.rewrite("/a/b/c"), "/one/b/c");
    }

    #[test]
    fn unmatched_input_passes_through() {
        let rw = rewriter(&[("^/TV/", "/mnt/TV/")]);
        assert_eq!(rw.rewrite("/Movies/film"), "/Movies/film");
    }

    #[test]
    fn rewrite_is_idempotent_for_disjoint_rules() {
        let rw = rewriter(&[("^/TV/", "/mnt/unionfs/Media/TV/")]);
        let once = rw.rewrite("/TV/Westworld");
        assert_eq!(rw.rewrite(&once), once);
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = Rewriter::new(&[Rewrite {
            from: "[".into(),
            to: "/x".into(),
        }])
        .unwrap_err();

        assert!(matches!(err, AutoscanError::Config(_)));
    }
}
