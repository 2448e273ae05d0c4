use crate::jid_utils::{decode_jid, is_group};
use serde::{Deserialize, Serialize};

/// Display metadata, split by the kind of conversation it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DisplayInfo {
    Individual {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        verified_name: Option<String>,
    },
    Group {
        #[serde(default)]
        subject: Option<String>,
    },
}

impl DisplayInfo {
    /// The best cached name. With `suppress_contact_name` the contact's own
    /// name is skipped, but verified names and group subjects still apply.
    pub fn resolve(&self, suppress_contact_name: bool) -> Option<&str> {
        match self {
            DisplayInfo::Individual {
                name,
                verified_name,
            } => {
                let name = if suppress_contact_name {
                    None
                } else {
                    non_empty(name)
                };
                name.or_else(|| non_empty(verified_name))
            }
            DisplayInfo::Group { subject } => non_empty(subject),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// A cached contact or group, keyed by canonical identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: String,
    pub info: DisplayInfo,
}

impl ContactRecord {
    /// Builds a record for `id` with `display_name`, choosing the variant from
    /// the identifier's server. The identifier is canonicalized.
    pub fn new(id: &str, display_name: Option<String>) -> Self {
        let id = decode_jid(id).into_owned();
        let info = if is_group(&id) {
            DisplayInfo::Group {
                subject: display_name,
            }
        } else {
            DisplayInfo::Individual {
                name: display_name,
                verified_name: None,
            }
        };
        Self { id, info }
    }

    pub fn group(id: &str, subject: impl Into<String>) -> Self {
        Self {
            id: decode_jid(id).into_owned(),
            info: DisplayInfo::Group {
                subject: Some(subject.into()),
            },
        }
    }

    pub fn individual(id: &str, name: Option<String>, verified_name: Option<String>) -> Self {
        Self {
            id: decode_jid(id).into_owned(),
            info: DisplayInfo::Individual {
                name,
                verified_name,
            },
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.info, DisplayInfo::Group { .. })
    }

    pub fn display_name(&self) -> Option<&str> {
        self.info.resolve(false)
    }
}

/// The account the session is logged in as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountIdentity {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Group metadata as returned by a live transport query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMetadata {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
}
