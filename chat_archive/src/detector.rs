use crate::model::Message;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// How an observation relates to what the store already had.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeStatus {
    New,
    /// Attributes whose value differs from the stored version.
    Changed(BTreeMap<String, Value>),
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub merged: Message,
    pub status: ChangeStatus,
}

impl Reconciled {
    /// Whether the merged message has to be written.
    pub fn is_dirty(&self) -> bool {
        !matches!(self.status, ChangeStatus::Unchanged)
    }
}

/// Merge a fresh observation of a message with the stored version.
///
/// Attributes the observation lacks are carried over from `prior`, so a
/// narrower observation never erases anything. A text change pushes the
/// previous text onto the edit history.
pub fn reconcile(observed: Message, prior: Option<&Message>) -> Reconciled {
    let Some(prior) = prior else {
        info!(id = observed.id, "new message");
        return Reconciled {
            merged: observed,
            status: ChangeStatus::New,
        };
    };

    let observed_attrs = observed.attributes();
    let text_changed = observed.text.is_some() && observed.text != prior.text;
    let mut merged = observed;
    merged.carry_forward(prior);
    if text_changed {
        merged.push_edit(prior.text.as_deref());
    }

    let merged_attrs = merged.attributes();
    let prior_attrs = prior.attributes();
    let changes: BTreeMap<String, Value> = observed_attrs
        .keys()
        .filter(|key| merged_attrs.get(*key) != prior_attrs.get(*key))
        .filter_map(|key| merged_attrs.get(key).map(|v| (key.clone(), v.clone())))
        .collect();

    if changes.is_empty() && !text_changed {
        debug!(id = merged.id, "message unchanged");
        return Reconciled {
            merged,
            status: ChangeStatus::Unchanged,
        };
    }
    info!(id = merged.id, ?changes, "changed message");
    Reconciled {
        merged,
        status: ChangeStatus::Changed(changes),
    }
}
