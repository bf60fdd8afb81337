use regex::Regex;
use std::sync::Arc;

use crate::error::AutoscanError;

/// Allows or rejects paths based on include/exclude regex lists.
///
/// Excludes are checked first and always reject. When includes are present,
/// at least one must match; with no includes every non-excluded path passes.
#[derive(Debug, Clone, Default)]
pub struct Filterer {
    includes: Arc<Vec<Regex>>,
    excludes: Arc<Vec<Regex>>,
}

impl Filterer {
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, AutoscanError> {
        Ok(Self {
            includes: Arc::new(compile(includes)?),
            excludes: Arc::new(compile(excludes)?),
        })
    }

    pub fn is_allowed(&self, path: &str) -> bool {
        if self.excludes.iter().any(|re| re.is_match(path)) {
            return false;
        }

        if self.includes.is_empty() {
            return true;
        }

        self.includes.iter().any(|re| re.is_match(path))
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, AutoscanError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| {
                AutoscanError::Config(format!("invalid filter pattern {pattern:?}: {err}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_accept_everything() {
        let f = Filterer::new(&[], &[]).unwrap();
        assert!(f.is_allowed("/anything/at/all"));
    }

    #[test]
    fn excludes_reject_first() {
        let f = Filterer::new(
            &["/Media/".to_owned()],
            &[r"\.sample\.".to_owned()],
        )
        .unwrap();

        assert!(f.is_allowed("/Media/Movies/film.mkv"));
        assert!(!f.is_allowed("/Media/Movies/film.sample.mkv"));
    }

    #[test]
    fn includes_require_a_match() {
        let f = Filterer::new(&["^/Media/".to_owned()], &[]).unwrap();
        assert!(f.is_allowed("/Media/TV/show"));
        assert!(!f.is_allowed("/downloads/TV/show"));
    }

    #[test]
    fn excludes_only_accepts_the_rest() {
        let f = Filterer::new(&[], &["^/tmp/".to_owned()]).unwrap();
        assert!(!f.is_allowed("/tmp/file"));
        assert!(f.is_allowed("/Media/file"));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = Filterer::new(&["(".to_owned()], &[]).unwrap_err();
        assert!(matches!(err, AutoscanError::Config(_)));
    }
}
