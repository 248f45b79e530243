/*
 * cache.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Traghetto, a cross-platform file transfer client.
 *
 * Traghetto is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Traghetto is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Traghetto.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Remote-state caches consulted by the engine: the directory cache (what
//! files a listed directory contained) and the path cache (which server path
//! a CWD into `parent/segment` actually landed in, symlinks resolved).

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::path::ServerPath;

/// Registry key: one cache namespace per (host, port, user).
pub type ServerKey = (String, u16, String);

/// One cached directory entry.
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
    /// Whether mtime carries a time of day (listings often have date only).
    pub has_time: bool,
    /// Entry may be stale (a rename or chmod touched it since listing).
    pub unsure: bool,
}

/// Result of a file lookup, including what we know about the directory.
#[derive(Debug, Clone, Default)]
pub struct FileLookup {
    pub entry: Option<DirEntry>,
    /// The directory itself was in the cache.
    pub dir_did_exist: bool,
    /// The name matched with exact case.
    pub matched_case: bool,
}

#[derive(Debug, Default)]
struct CachedDir {
    entries: HashMap<String, DirEntry>,
}

/// Cache of directory listings per server.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    dirs: HashMap<(ServerKey, String), CachedDir>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup_file(&self, server: &ServerKey, path: &ServerPath, name: &str) -> FileLookup {
        let dir = match self.dirs.get(&(server.clone(), path.get_path())) {
            Some(d) => d,
            None => return FileLookup::default(),
        };
        if let Some(entry) = dir.entries.get(name) {
            return FileLookup {
                entry: Some(entry.clone()),
                dir_did_exist: true,
                matched_case: true,
            };
        }
        let lower = name.to_lowercase();
        let caseless = dir
            .entries
            .values()
            .find(|e| e.name.to_lowercase() == lower)
            .cloned();
        FileLookup {
            entry: caseless,
            dir_did_exist: true,
            matched_case: false,
        }
    }

    /// Replace the cached listing of `path`.
    pub fn store(&mut self, server: &ServerKey, path: &ServerPath, entries: Vec<DirEntry>) {
        let dir = CachedDir {
            entries: entries.into_iter().map(|e| (e.name.clone(), e)).collect(),
        };
        self.dirs.insert((server.clone(), path.get_path()), dir);
    }

    /// Mark one file stale without forgetting it.
    pub fn invalidate_file(&mut self, server: &ServerKey, path: &ServerPath, name: &str) {
        if let Some(dir) = self.dirs.get_mut(&(server.clone(), path.get_path())) {
            if let Some(e) = dir.entries.get_mut(name) {
                e.unsure = true;
            }
        }
    }

    /// Update (or insert) a file entry after an operation we performed
    /// ourselves (upload, chmod). `size` None marks the size unknown.
    pub fn update_file(
        &mut self,
        server: &ServerKey,
        path: &ServerPath,
        name: &str,
        is_dir: bool,
        size: Option<u64>,
    ) {
        if let Some(dir) = self.dirs.get_mut(&(server.clone(), path.get_path())) {
            let e = dir.entries.entry(name.to_string()).or_default();
            e.name = name.to_string();
            e.is_dir = is_dir;
            e.size = size;
            e.unsure = true;
        }
    }

    pub fn remove_file(&mut self, server: &ServerKey, path: &ServerPath, name: &str) {
        if let Some(dir) = self.dirs.get_mut(&(server.clone(), path.get_path())) {
            dir.entries.remove(name);
        }
    }

    /// Drop a directory and everything cached below it.
    pub fn remove_dir(&mut self, server: &ServerKey, path: &ServerPath, sub_dir: &str) {
        let mut full = path.clone();
        if !full.add_segment(sub_dir) {
            return;
        }
        self.dirs.retain(|(srv, dir_path), _| {
            srv != server || !full.contains(&ServerPath::parse(dir_path, full.kind()))
        });
        self.remove_file(server, path, sub_dir);
    }

    pub fn rename(
        &mut self,
        server: &ServerKey,
        from_path: &ServerPath,
        from_name: &str,
        to_path: &ServerPath,
        to_name: &str,
    ) {
        let moved = self
            .dirs
            .get_mut(&(server.clone(), from_path.get_path()))
            .and_then(|d| d.entries.remove(from_name));
        if let Some(mut e) = moved {
            e.name = to_name.to_string();
            e.unsure = true;
            if let Some(dir) = self.dirs.get_mut(&(server.clone(), to_path.get_path())) {
                dir.entries.insert(to_name.to_string(), e);
            }
        }
    }

    pub fn invalidate_server(&mut self, server: &ServerKey) {
        self.dirs.retain(|(srv, _), _| srv != server);
    }
}

/// Cache of `(parent, segment) -> actual path` mappings learned from PWD
/// after CWD, used to compact later walks and record symlink targets.
#[derive(Debug, Default)]
pub struct PathCache {
    paths: HashMap<(ServerKey, String, String), ServerPath>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(
        &self,
        server: &ServerKey,
        parent: &ServerPath,
        segment: &str,
    ) -> Option<&ServerPath> {
        self.paths
            .get(&(server.clone(), parent.get_path(), segment.to_string()))
    }

    pub fn store(
        &mut self,
        server: &ServerKey,
        parent: &ServerPath,
        segment: &str,
        target: ServerPath,
    ) {
        if target.is_empty() {
            return;
        }
        self.paths.insert(
            (server.clone(), parent.get_path(), segment.to_string()),
            target,
        );
    }

    pub fn invalidate_path(&mut self, server: &ServerKey, parent: &ServerPath, segment: &str) {
        self.paths
            .remove(&(server.clone(), parent.get_path(), segment.to_string()));
    }

    pub fn invalidate_server(&mut self, server: &ServerKey) {
        self.paths.retain(|(srv, _, _), _| srv != server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathKind;

    fn server() -> ServerKey {
        ("host".to_string(), 21, "u".to_string())
    }

    fn path(s: &str) -> ServerPath {
        ServerPath::parse(s, PathKind::Default)
    }

    fn entry(name: &str, size: u64) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            size: Some(size),
            ..DirEntry::default()
        }
    }

    #[test]
    fn lookup_absent_directory() {
        let cache = DirectoryCache::new();
        let r = cache.lookup_file(&server(), &path("/a"), "f");
        assert!(r.entry.is_none());
        assert!(!r.dir_did_exist);
    }

    #[test]
    fn lookup_case_insensitive_fallback() {
        let mut cache = DirectoryCache::new();
        cache.store(&server(), &path("/a"), vec![entry("File.TXT", 7)]);
        let r = cache.lookup_file(&server(), &path("/a"), "file.txt");
        assert!(r.dir_did_exist);
        assert!(!r.matched_case);
        assert_eq!(r.entry.unwrap().size, Some(7));
    }

    #[test]
    fn invalidate_marks_unsure() {
        let mut cache = DirectoryCache::new();
        cache.store(&server(), &path("/a"), vec![entry("f", 1)]);
        cache.invalidate_file(&server(), &path("/a"), "f");
        let r = cache.lookup_file(&server(), &path("/a"), "f");
        assert!(r.entry.unwrap().unsure);
    }

    #[test]
    fn remove_dir_drops_subtree() {
        let mut cache = DirectoryCache::new();
        cache.store(&server(), &path("/a"), vec![entry("sub", 0)]);
        cache.store(&server(), &path("/a/sub"), vec![entry("f", 1)]);
        cache.store(&server(), &path("/a/sub/deep"), vec![entry("g", 2)]);
        cache.remove_dir(&server(), &path("/a"), "sub");
        assert!(!cache.lookup_file(&server(), &path("/a/sub"), "f").dir_did_exist);
        assert!(!cache
            .lookup_file(&server(), &path("/a/sub/deep"), "g")
            .dir_did_exist);
        assert!(cache.lookup_file(&server(), &path("/a"), "sub").entry.is_none());
    }

    #[test]
    fn rename_moves_entry() {
        let mut cache = DirectoryCache::new();
        cache.store(&server(), &path("/a"), vec![entry("x", 5)]);
        cache.store(&server(), &path("/b"), vec![]);
        cache.rename(&server(), &path("/a"), "x", &path("/b"), "y");
        assert!(cache.lookup_file(&server(), &path("/a"), "x").entry.is_none());
        let moved = cache.lookup_file(&server(), &path("/b"), "y").entry.unwrap();
        assert_eq!(moved.size, Some(5));
        assert!(moved.unsure);
    }

    #[test]
    fn path_cache_roundtrip() {
        let mut cache = PathCache::new();
        cache.store(&server(), &path("/a"), "link", path("/real/target"));
        assert_eq!(
            cache.lookup(&server(), &path("/a"), "link").unwrap().get_path(),
            "/real/target"
        );
        cache.invalidate_path(&server(), &path("/a"), "link");
        assert!(cache.lookup(&server(), &path("/a"), "link").is_none());
    }
}
