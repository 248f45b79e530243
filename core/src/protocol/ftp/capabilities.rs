/*
 * capabilities.rs
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

//! Per-server capability registry: what a server advertised in FEAT and what
//! quirks probing confirmed. Keyed by (host, port, user); entries live for
//! the registry's lifetime and can be snapshotted to disk as XML.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;

/// A discovered fact about a server, or the absence of a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Unknown,
    Yes,
    No,
}

/// Capabilities the engine probes and remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Utf8Command,
    ClntCommand,
    /// Parameter carries the MLST facts string.
    MlsdCommand,
    ModeZSupport,
    MfmtCommand,
    MdtmCommand,
    SizeCommand,
    TvfsSupport,
    RestStream,
    EpsvCommand,
    TimezoneOffset,
    Resume2GbBug,
    Resume4GbBug,
}

impl Capability {
    pub const ALL: [Capability; 13] = [
        Capability::Utf8Command,
        Capability::ClntCommand,
        Capability::MlsdCommand,
        Capability::ModeZSupport,
        Capability::MfmtCommand,
        Capability::MdtmCommand,
        Capability::SizeCommand,
        Capability::TvfsSupport,
        Capability::RestStream,
        Capability::EpsvCommand,
        Capability::TimezoneOffset,
        Capability::Resume2GbBug,
        Capability::Resume4GbBug,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Capability::Utf8Command => "utf8_command",
            Capability::ClntCommand => "clnt_command",
            Capability::MlsdCommand => "mlsd_command",
            Capability::ModeZSupport => "mode_z_support",
            Capability::MfmtCommand => "mfmt_command",
            Capability::MdtmCommand => "mdtm_command",
            Capability::SizeCommand => "size_command",
            Capability::TvfsSupport => "tvfs_support",
            Capability::RestStream => "rest_stream",
            Capability::EpsvCommand => "epsv_command",
            Capability::TimezoneOffset => "timezone_offset",
            Capability::Resume2GbBug => "resume2gb_bug",
            Capability::Resume4GbBug => "resume4gb_bug",
        }
    }

    fn from_name(name: &str) -> Option<Capability> {
        Capability::ALL.iter().copied().find(|c| c.name() == name)
    }
}

type ServerKey = (String, u16, String);

#[derive(Debug, Clone, Default)]
struct Entry {
    state: TriState,
    param: String,
}

/// Session-scoped capability store. Passed by reference to the engine; no
/// global state.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    servers: HashMap<ServerKey, HashMap<Capability, Entry>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ServerKey, cap: Capability) -> TriState {
        self.servers
            .get(key)
            .and_then(|m| m.get(&cap))
            .map(|e| e.state)
            .unwrap_or(TriState::Unknown)
    }

    /// Parameter stored with a Yes capability (e.g. MLST facts).
    pub fn param(&self, key: &ServerKey, cap: Capability) -> Option<&str> {
        self.servers
            .get(key)
            .and_then(|m| m.get(&cap))
            .filter(|e| e.state == TriState::Yes && !e.param.is_empty())
            .map(|e| e.param.as_str())
    }

    /// Record a probe result. Setting Yes without a parameter keeps a
    /// previously stored parameter; Unknown is never written back.
    pub fn set(&mut self, key: &ServerKey, cap: Capability, state: TriState) {
        self.set_with_param(key, cap, state, None);
    }

    pub fn set_with_param(
        &mut self,
        key: &ServerKey,
        cap: Capability,
        state: TriState,
        param: Option<&str>,
    ) {
        if state == TriState::Unknown {
            return;
        }
        let entry = self
            .servers
            .entry(key.clone())
            .or_default()
            .entry(cap)
            .or_default();
        entry.state = state;
        if let Some(p) = param {
            entry.param = p.to_string();
        }
    }

    pub fn forget_server(&mut self, key: &ServerKey) {
        self.servers.remove(key);
    }

    /// Serialize all entries as a versioned XML document.
    pub fn save(&self, path: &Path) -> Result<(), String> {
        let mut out = Vec::new();
        let mut writer = Writer::new(&mut out);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(|e| e.to_string())?;
        let mut root = BytesStart::new("capabilities");
        root.push_attribute(("version", "1"));
        writer.write_event(Event::Start(root)).map_err(|e| e.to_string())?;
        let mut keys: Vec<&ServerKey> = self.servers.keys().collect();
        keys.sort();
        for key in keys {
            let caps = &self.servers[key];
            let mut server = BytesStart::new("server");
            server.push_attribute(("host", key.0.as_str()));
            server.push_attribute(("port", key.1.to_string().as_str()));
            server.push_attribute(("user", key.2.as_str()));
            writer
                .write_event(Event::Start(server))
                .map_err(|e| e.to_string())?;
            let mut caps_sorted: Vec<(&Capability, &Entry)> = caps.iter().collect();
            caps_sorted.sort_by_key(|(c, _)| c.name());
            for (cap, entry) in caps_sorted {
                let mut el = BytesStart::new("capability");
                el.push_attribute(("name", cap.name()));
                let state = match entry.state {
                    TriState::Yes => "yes",
                    TriState::No => "no",
                    TriState::Unknown => continue,
                };
                el.push_attribute(("state", state));
                if !entry.param.is_empty() {
                    el.push_attribute(("param", entry.param.as_str()));
                }
                writer.write_event(Event::Empty(el)).map_err(|e| e.to_string())?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("server")))
                .map_err(|e| e.to_string())?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("capabilities")))
            .map_err(|e| e.to_string())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::write(path, out).map_err(|e| e.to_string())
    }

    /// Load a snapshot previously written by [`CapabilityRegistry::save`].
    /// A missing file yields an empty registry.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CapabilityRegistry::new())
            }
            Err(e) => return Err(e.to_string()),
        };
        let mut reader = Reader::from_str(&content);
        reader.config_mut().trim_text(true);
        let mut buf = Vec::new();
        let mut registry = CapabilityRegistry::new();
        let mut current: Option<ServerKey> = None;
        loop {
            match reader.read_event_into(&mut buf) {
                Err(e) => return Err(format!("XML parse error: {}", e)),
                Ok(Event::Eof) => break,
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let name = e.name();
                    let name = name.as_ref().to_vec();
                    let mut attrs: HashMap<String, String> = HashMap::new();
                    for a in e.attributes().flatten() {
                        let k = String::from_utf8_lossy(a.key.as_ref()).to_string();
                        let v = a.unescape_value().map_err(|e| e.to_string())?.to_string();
                        attrs.insert(k, v);
                    }
                    if name == b"server" {
                        let host = attrs.remove("host").unwrap_or_default();
                        let port = attrs
                            .remove("port")
                            .and_then(|p| p.parse().ok())
                            .unwrap_or(21);
                        let user = attrs.remove("user").unwrap_or_default();
                        current = Some((host, port, user));
                    } else if name == b"capability" {
                        if let Some(key) = &current {
                            let cap = attrs.get("name").and_then(|n| Capability::from_name(n));
                            let state = match attrs.get("state").map(String::as_str) {
                                Some("yes") => TriState::Yes,
                                Some("no") => TriState::No,
                                _ => TriState::Unknown,
                            };
                            if let Some(cap) = cap {
                                registry.set_with_param(
                                    key,
                                    cap,
                                    state,
                                    attrs.get("param").map(String::as_str),
                                );
                            }
                        }
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"server" {
                        current = None;
                    }
                }
                _ => {}
            }
            buf.clear();
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ServerKey {
        ("ftp.example.org".to_string(), 21, "alice".to_string())
    }

    #[test]
    fn unknown_by_default() {
        let reg = CapabilityRegistry::new();
        assert_eq!(reg.get(&key(), Capability::SizeCommand), TriState::Unknown);
    }

    #[test]
    fn set_and_get_with_param() {
        let mut reg = CapabilityRegistry::new();
        reg.set_with_param(
            &key(),
            Capability::MlsdCommand,
            TriState::Yes,
            Some("type*;size*;modify*;"),
        );
        assert_eq!(reg.get(&key(), Capability::MlsdCommand), TriState::Yes);
        assert_eq!(
            reg.param(&key(), Capability::MlsdCommand),
            Some("type*;size*;modify*;")
        );
    }

    #[test]
    fn yes_without_param_keeps_existing_param() {
        let mut reg = CapabilityRegistry::new();
        reg.set_with_param(&key(), Capability::MlsdCommand, TriState::Yes, Some("facts"));
        reg.set(&key(), Capability::MlsdCommand, TriState::Yes);
        assert_eq!(reg.param(&key(), Capability::MlsdCommand), Some("facts"));
    }

    #[test]
    fn unknown_never_overwrites() {
        let mut reg = CapabilityRegistry::new();
        reg.set(&key(), Capability::Resume4GbBug, TriState::No);
        reg.set(&key(), Capability::Resume4GbBug, TriState::Unknown);
        assert_eq!(reg.get(&key(), Capability::Resume4GbBug), TriState::No);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut reg = CapabilityRegistry::new();
        reg.set_with_param(&key(), Capability::MlsdCommand, TriState::Yes, Some("type*;"));
        reg.set(&key(), Capability::Resume2GbBug, TriState::Yes);
        reg.set(&key(), Capability::EpsvCommand, TriState::No);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capabilities.xml");
        reg.save(&path).unwrap();

        let loaded = CapabilityRegistry::load(&path).unwrap();
        assert_eq!(loaded.get(&key(), Capability::MlsdCommand), TriState::Yes);
        assert_eq!(loaded.param(&key(), Capability::MlsdCommand), Some("type*;"));
        assert_eq!(loaded.get(&key(), Capability::Resume2GbBug), TriState::Yes);
        assert_eq!(loaded.get(&key(), Capability::EpsvCommand), TriState::No);
        assert_eq!(loaded.get(&key(), Capability::SizeCommand), TriState::Unknown);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let reg = CapabilityRegistry::load(&dir.path().join("nope.xml")).unwrap();
        assert_eq!(reg.get(&key(), Capability::SizeCommand), TriState::Unknown);
    }
}
