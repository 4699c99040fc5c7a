//! Request types for the two operator-facing commands (`DevGroupSend` and
//! `DevGroupStatus` in the original Tasmota console). These are thin
//! wrappers; the actual work lives on [`crate::engine::Engine`].

use crate::wire::Item;

/// `DevGroupSend <group> <tag>=<value>...`: originate an update from a
/// local change.
#[derive(Debug, Clone)]
pub struct DevGroupSend {
    /// Target group name.
    pub group: String,
    /// Items to publish.
    pub items: Vec<Item>,
}

impl DevGroupSend {
    /// Build a send request for a single item.
    pub fn single(group: impl Into<String>, item: Item) -> Self {
        Self {
            group: group.into(),
            items: vec![item],
        }
    }
}

/// `DevGroupStatus [<index>]`: request a snapshot of one group's state and
/// member table. `None` means "the first configured group".
#[derive(Debug, Clone, Copy, Default)]
pub struct DevGroupStatus {
    /// Index into the configured group list, if given.
    pub group_index: Option<usize>,
}
