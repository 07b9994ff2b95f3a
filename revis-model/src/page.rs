use crate::ids::SessionId;
use crate::key::KeyRecord;

/// One page of a scan as handed to the calling layer.
///
/// `session_id` is present exactly when `has_more` is set; it must be passed
/// back to fetch the following page. Ids are single use: every continued page
/// carries a new one, and the id it was fetched with stops working.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct ScanPage {
    pub keys: Vec<KeyRecord>,
    #[cfg_attr(feature = "serde", serde(skip_serializing_if = "Option::is_none"))]
    pub session_id: Option<SessionId>,
    pub has_more: bool,
}

impl ScanPage {
    pub fn last(keys: Vec<KeyRecord>) -> Self {
        Self {
            keys,
            session_id: None,
            has_more: false,
        }
    }

    pub fn continued(keys: Vec<KeyRecord>, session_id: SessionId) -> Self {
        Self {
            keys,
            session_id: Some(session_id),
            has_more: true,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
