use std::collections::{HashMap, HashSet};

use crate::error::AutoscanError;
use crate::triggers::drive::diff::{
    file_maps, folder_maps, DriveDiff, DriveFile, DriveFolder,
};
use crate::triggers::drive::store::MirrorStore;

/// Absolute file paths derived from one normalized diff.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Paths {
    pub added: Vec<String>,
    pub changed: Vec<String>,
    pub removed: Vec<String>,
}

/// Projects a diff into file paths by walking parent chains up to the drive
/// root. The in-memory folder maps are preferred and populated on the way,
/// so each ancestor hits the mirror at most once.
pub fn project_paths(
    store: &MirrorStore,
    drive_id: &str,
    diff: &DriveDiff,
) -> Result<Paths, AutoscanError> {
    let mut folders = folder_maps(diff);
    let mut files = file_maps(diff);
    let mut paths = Paths::default();

    for file in &diff.added_files {
        let parent = folder_path(store, drive_id, &file.parent, &mut folders.current)?;
        paths.added.push(file_path(&parent, &file.name));
    }

    for changed in &diff.changed_files {
        let parent = folder_path(store, drive_id, &changed.new.parent, &mut folders.current)?;
        paths.changed.push(file_path(&parent, &changed.new.name));

        // a move or rename leaves a stale path behind
        let relocated =
            changed.old.parent != changed.new.parent || changed.old.name != changed.new.name;
        if relocated && !changed.old.trashed && !changed.old.id.is_empty() {
            let parent = folder_path(store, drive_id, &changed.old.parent, &mut folders.old)?;
            paths.removed.push(file_path(&parent, &changed.old.name));
        }
    }

    for file in &diff.removed_files {
        let parent = folder_path(store, drive_id, &file.parent, &mut folders.old)?;
        paths.removed.push(file_path(&parent, &file.name));
    }

    // changed folders pull their descendant files in, under both trees
    let (new_roots, old_roots) = root_changed_folders(diff);

    let changed_descendants =
        changed_folder_files(store, drive_id, &new_roots, &mut folders.current, &mut files.current)?;
    for file in changed_descendants {
        let parent = folder_path(store, drive_id, &file.parent, &mut folders.current)?;
        paths.changed.push(file_path(&parent, &file.name));
    }

    let removed_descendants =
        changed_folder_files(store, drive_id, &old_roots, &mut folders.old, &mut files.old)?;
    for file in removed_descendants {
        if file.trashed {
            continue;
        }

        let parent = folder_path(store, drive_id, &file.parent, &mut folders.old)?;
        paths.removed.push(file_path(&parent, &file.name));
    }

    Ok(paths)
}

fn file_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        format!("/{name}")
    } else {
        format!("/{parent}/{name}")
    }
}

/// Builds a folder's path relative to the drive root, memoizing mirror
/// lookups into `map` so the walk is O(depth) after warm-up.
fn folder_path(
    store: &MirrorStore,
    drive_id: &str,
    folder_id: &str,
    map: &mut HashMap<String, DriveFolder>,
) -> Result<String, AutoscanError> {
    if folder_id == drive_id {
        return Ok(String::new());
    }

    let top = match map.get(folder_id) {
        Some(folder) => folder.clone(),
        None => store
            .get_folder(drive_id, folder_id)?
            .ok_or_else(|| AutoscanError::Fatal(format!("folder not in mirror: {folder_id}")))?,
    };

    let mut path = top.name;
    let mut next = top.parent;

    while !next.is_empty() && next != drive_id {
        let folder = match map.get(&next) {
            Some(folder) => folder.clone(),
            None => {
                let folder = store.get_folder(drive_id, &next)?.ok_or_else(|| {
                    AutoscanError::Fatal(format!("folder not in mirror: {next}"))
                })?;
                map.insert(folder.id.clone(), folder.clone());
                folder
            }
        };

        path = format!("{}/{}", folder.name, path);
        next = folder.parent;
    }

    Ok(path)
}

/// The root-most changed folders: those whose parent is not itself part of
/// the changed set. Only these need their subtrees expanded.
fn root_changed_folders(diff: &DriveDiff) -> (Vec<DriveFolder>, Vec<DriveFolder>) {
    let new_folders: Vec<DriveFolder> = diff.changed_folders.iter().map(|c| c.new.clone()).collect();
    let old_folders: Vec<DriveFolder> = diff.changed_folders.iter().map(|c| c.old.clone()).collect();

    (root_most(new_folders), root_most(old_folders))
}

fn root_most(folders: Vec<DriveFolder>) -> Vec<DriveFolder> {
    let ids: HashSet<String> = folders.iter().map(|f| f.id.clone()).collect();
    folders
        .into_iter()
        .filter(|folder| !ids.contains(&folder.parent))
        .collect()
}

/// Collects descendant files of the given roots that are not already covered
/// by a file-level change, populating the folder map along the way.
fn changed_folder_files(
    store: &MirrorStore,
    drive_id: &str,
    roots: &[DriveFolder],
    folder_map: &mut HashMap<String, DriveFolder>,
    file_map: &mut HashMap<String, DriveFile>,
) -> Result<Vec<DriveFile>, AutoscanError> {
    let mut collected = Vec::new();

    for root in roots {
        let descendants = store.folder_descendants(drive_id, &root.id)?;

        for (id, folder) in descendants.folders {
            folder_map.entry(id).or_insert(folder);
        }

        for (id, file) in descendants.files {
            if file_map.contains_key(&id) {
                continue;
            }

            file_map.insert(id, file.clone());
            collected.push(file);
        }
    }

    collected.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(collected)
}
