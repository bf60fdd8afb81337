use std::collections::{HashMap, HashSet};

use crate::error::AutoscanError;
use crate::triggers::drive::store::MirrorStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub trashed: bool,
    pub size: i64,
    pub md5: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriveFolder {
    pub id: String,
    pub name: String,
    pub parent: String,
    pub trashed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changed<T> {
    pub old: T,
    pub new: T,
}

/// The added/changed/removed sets captured from one partial sync. Consumed
/// and discarded within a single job run.
#[derive(Debug, Clone, Default)]
pub struct DriveDiff {
    pub added_files: Vec<DriveFile>,
    pub changed_files: Vec<Changed<DriveFile>>,
    pub removed_files: Vec<DriveFile>,
    pub added_folders: Vec<DriveFolder>,
    pub changed_folders: Vec<Changed<DriveFolder>>,
    pub removed_folders: Vec<DriveFolder>,
}

/// Folder lookups for path building. `current` reflects the post-sync tree,
/// `old` the pre-sync tree; added folders appear in both so freshly created
/// ancestors resolve either way.
pub struct FolderMaps {
    pub current: HashMap<String, DriveFolder>,
    pub old: HashMap<String, DriveFolder>,
}

pub fn folder_maps(diff: &DriveDiff) -> FolderMaps {
    let mut current = HashMap::new();
    let mut old = HashMap::new();

    for folder in &diff.added_folders {
        current.insert(folder.id.clone(), folder.clone());
        old.insert(folder.id.clone(), folder.clone());
    }

    for changed in &diff.changed_folders {
        current.insert(changed.new.id.clone(), changed.new.clone());
        old.insert(changed.old.id.clone(), changed.old.clone());
    }

    FolderMaps { current, old }
}

pub struct FileMaps {
    pub current: HashMap<String, DriveFile>,
    pub old: HashMap<String, DriveFile>,
}

pub fn file_maps(diff: &DriveDiff) -> FileMaps {
    let mut current = HashMap::new();
    let mut old = HashMap::new();

    for file in &diff.added_files {
        current.insert(file.id.clone(), file.clone());
    }

    for changed in &diff.changed_files {
        current.insert(changed.new.id.clone(), changed.new.clone());
        old.insert(changed.old.id.clone(), changed.old.clone());
    }

    FileMaps { current, old }
}

/// Normalizes a raw diff against the mirror's pre-sync state:
///
/// - removals whose prior row was already trashed are dropped,
/// - a "changed" entry whose trashed flag flipped is reclassified as an add
///   or a removal,
/// - an entry that was both added and removed within the same diff cancels
///   out entirely.
pub fn postprocess(
    store: &MirrorStore,
    drive_id: &str,
    diff: &mut DriveDiff,
) -> Result<(), AutoscanError> {
    let mut kept_files = Vec::with_capacity(diff.removed_files.len());
    for removed in diff.removed_files.drain(..) {
        let prior = store.get_file(drive_id, &removed.id)?;
        match prior {
            Some(prior) if prior.trashed => {}
            _ => kept_files.push(removed),
        }
    }
    diff.removed_files = kept_files;

    let mut kept_folders = Vec::with_capacity(diff.removed_folders.len());
    for removed in diff.removed_folders.drain(..) {
        let prior = store.get_folder(drive_id, &removed.id)?;
        match prior {
            Some(prior) if prior.trashed => {}
            _ => kept_folders.push(removed),
        }
    }
    diff.removed_folders = kept_folders;

    let mut kept_changed = Vec::with_capacity(diff.changed_files.len());
    for changed in diff.changed_files.drain(..) {
        match (changed.old.trashed, changed.new.trashed) {
            (true, false) => diff.added_files.push(changed.new),
            (false, true) => diff.removed_files.push(changed.new),
            _ => kept_changed.push(changed),
        }
    }
    diff.changed_files = kept_changed;

    let mut kept_changed = Vec::with_capacity(diff.changed_folders.len());
    for changed in diff.changed_folders.drain(..) {
        match (changed.old.trashed, changed.new.trashed) {
            (true, false) => diff.added_folders.push(changed.new),
            (false, true) => diff.removed_folders.push(changed.new),
            _ => kept_changed.push(changed),
        }
    }
    diff.changed_folders = kept_changed;

    // an add and a removal for the same id in one window cancel out
    let added_ids: HashSet<String> = diff.added_files.iter().map(|f| f.id.clone()).collect();
    let removed_ids: HashSet<String> = diff.removed_files.iter().map(|f| f.id.clone()).collect();
    let both: HashSet<&String> = added_ids.intersection(&removed_ids).collect();
    if !both.is_empty() {
        diff.added_files.retain(|f| !both.contains(&f.id));
        diff.removed_files.retain(|f| !both.contains(&f.id));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, name: &str, parent: &str, trashed: bool) -> DriveFile {
        DriveFile {
            id: id.into(),
            name: name.into(),
            parent: parent.into(),
            trashed,
            size: 0,
            md5: String::new(),
        }
    }

    fn folder(id: &str, name: &str, parent: &str, trashed: bool) -> DriveFolder {
        DriveFolder {
            id: id.into(),
            name: name.into(),
            parent: parent.into(),
            trashed,
        }
    }

    fn empty_store() -> MirrorStore {
        MirrorStore::open_memory().unwrap()
    }

    #[test]
    fn maps_prefer_new_state_in_current_and_old_state_in_old() {
        let mut diff = DriveDiff::default();
        diff.added_folders.push(folder("a", "Added", "root", false));
        diff.changed_folders.push(Changed {
            old: folder("c", "Old Name", "root", false),
            new: folder("c", "New Name", "root", false),
        });

        let maps = folder_maps(&diff);
        assert_eq!(maps.current["c"].name, "New Name");
        assert_eq!(maps.old["c"].name, "Old Name");
        assert!(maps.current.contains_key("a") && maps.old.contains_key("a"));
    }

    #[test]
    fn trashed_flip_reclassifies_changed_entries() {
        let store = empty_store();
        let mut diff = DriveDiff::default();
        diff.changed_files.push(Changed {
            old: file("restored", "film.mkv", "root", true),
            new: file("restored", "film.mkv", "root", false),
        });
        diff.changed_files.push(Changed {
            old: file("binned", "old.mkv", "root", false),
            new: file("binned", "old.mkv", "root", true),
        });
        diff.changed_files.push(Changed {
            old: file("moved", "film.mkv", "a", false),
            new: file("moved", "film.mkv", "b", false),
        });

        postprocess(&store, "drive-1", &mut diff).unwrap();

        assert_eq!(diff.added_files.len(), 1);
        assert_eq!(diff.added_files[0].id, "restored");
        assert_eq!(diff.removed_files.len(), 1);
        assert_eq!(diff.removed_files[0].id, "binned");
        assert_eq!(diff.changed_files.len(), 1);
        assert_eq!(diff.changed_files[0].new.id, "moved");
    }

    #[test]
    fn removals_of_already_trashed_rows_are_dropped() {
        let store = empty_store();
        store
            .seed(
                "drive-1",
                &[folder("root-f", "Media", "drive-1", false)],
                &[
                    file("gone", "a.mkv", "root-f", true),
                    file("live", "b.mkv", "root-f", false),
                ],
            )
            .unwrap();

        let mut diff = DriveDiff::default();
        diff.removed_files.push(file("gone", "a.mkv", "root-f", true));
        diff.removed_files.push(file("live", "b.mkv", "root-f", true));

        postprocess(&store, "drive-1", &mut diff).unwrap();

        assert_eq!(diff.removed_files.len(), 1);
        assert_eq!(diff.removed_files[0].id, "live");
    }

    #[test]
    fn add_and_remove_in_one_diff_cancel_out() {
        let store = empty_store();
        let mut diff = DriveDiff::default();
        diff.added_files.push(file("burst", "tmp.mkv", "root", false));
        diff.removed_files.push(file("burst", "tmp.mkv", "root", false));

        postprocess(&store, "drive-1", &mut diff).unwrap();

        assert!(diff.added_files.is_empty());
        assert!(diff.removed_files.is_empty());
    }
}
