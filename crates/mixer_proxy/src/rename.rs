//! Rename application and conflict resolution
//!
//! Two peers may rename the same datablock concurrently. A received rename
//! whose old and new names both differ from the local name reveals such a
//! race: the datablock is then renamed to a name derived from its uuid and
//! a corrective rename is broadcast. Every peer that sees the race derives
//! the same name, so all peers converge.
//!
//! Renames are applied in two passes, through placeholder names, so that
//! swapping the names of two datablocks never triggers the automatic
//! `Name.001` disambiguation of the document.

use crate::changeset::Rename;
use crate::document::Document;
use crate::handle::LiveHandle;
use crate::id::{NodeKind, NodeUuid};
use crate::state::ProxyState;

/// Name all peers agree on after a rename conflict
pub fn fallback_name(kind: NodeKind, uuid: NodeUuid) -> String {
    format!("{}_{}", kind.label(), uuid)
}

struct PendingRename<'a> {
    rename: &'a Rename,
    handle: Option<LiveHandle>,
    target: String,
    conflict: bool,
}

impl ProxyState {
    /// Apply received renames to the proxies and the live document.
    ///
    /// Returns the corrective renames to broadcast.
    pub fn rename_datablocks(&mut self, renames: &[Rename], doc: &mut Document) -> Vec<Rename> {
        let mut pending = Vec::with_capacity(renames.len());
        for rename in renames {
            let Some(proxy) = self.proxies.get(&rename.uuid) else {
                log::warn!("Rename of unknown datablock {} ignored", rename.uuid);
                continue;
            };
            let handle = self.handles.get(&rename.uuid).copied().filter(|h| doc.contains(*h));
            let current = handle
                .and_then(|h| doc.get(h))
                .map(|node| node.name().to_string())
                .unwrap_or_else(|| proxy.name.clone());

            let conflict = current != rename.old_name && current != rename.new_name;
            let target = if conflict {
                let fallback = fallback_name(rename.kind, rename.uuid);
                log::info!(
                    "Rename conflict on {}: local '{}', received '{}' -> '{}', using '{}'",
                    rename.uuid,
                    current,
                    rename.old_name,
                    rename.new_name,
                    fallback
                );
                fallback
            } else {
                rename.new_name.clone()
            };
            pending.push(PendingRename {
                rename,
                handle,
                target,
                conflict,
            });
        }

        // Pass 1: free every name involved
        for item in &pending {
            if let Some(handle) = item.handle {
                let placeholder = format!("{}{}", self.config.temp_name_prefix, item.rename.uuid);
                if let Err(e) = doc.rename(handle, &placeholder) {
                    log::warn!("Failed to rename {}: {}", item.rename.uuid, e);
                }
            }
        }

        // Pass 2: final names
        let mut corrective = Vec::new();
        for item in pending {
            let rename = item.rename;
            let mut effective = item.target.clone();
            let mut conflict = item.conflict;

            if let Some(handle) = item.handle {
                match doc.rename(handle, &item.target) {
                    Ok(name) if name == item.target => {}
                    Ok(_) => {
                        // Taken by a datablock not involved in this batch
                        conflict = true;
                        effective = fallback_name(rename.kind, rename.uuid);
                        if let Err(e) = doc.rename(handle, &effective) {
                            log::warn!("Failed to rename {}: {}", rename.uuid, e);
                        }
                    }
                    Err(e) => log::warn!("Failed to rename {}: {}", rename.uuid, e),
                }
            }

            if let Some(proxy) = self.proxies.get_mut(&rename.uuid) {
                proxy.name = effective.clone();
            }
            if conflict && effective != rename.new_name {
                corrective.push(Rename {
                    uuid: rename.uuid,
                    kind: rename.kind,
                    old_name: rename.new_name.clone(),
                    new_name: effective,
                });
            }
        }
        corrective
    }
}
