use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7().simple()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(MessageId, "msg");
branded_id!(QuestionId, "q4h");
branded_id!(FuncCallId, "call");

/// Short opaque identifier used for dialog self/root ids.
///
/// Taken from the random tail of a v7 uuid so ids minted in the same
/// millisecond still differ.
pub fn new_short_id() -> String {
    let simple = Uuid::now_v7().simple().to_string();
    simple[simple.len() - 10..].to_string()
}

/// Identity of a dialog inside its tree.
///
/// `root_id == self_id` for a root dialog. The textual form is `root_id`
/// alone for roots and `root_id#self_id` for subdialogs.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogId {
    pub self_id: String,
    pub root_id: String,
}

impl DialogId {
    pub fn root(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            self_id: id.clone(),
            root_id: id,
        }
    }

    pub fn sub(root_id: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            root_id: root_id.into(),
        }
    }

    /// Mint a fresh root id.
    pub fn new_root() -> Self {
        Self::root(new_short_id())
    }

    /// Mint a fresh subdialog id inside `root_id`'s tree.
    pub fn new_sub(root_id: &str) -> Self {
        Self::sub(root_id, new_short_id())
    }

    pub fn is_root(&self) -> bool {
        self.self_id == self.root_id
    }

    /// The id of this tree's root dialog.
    pub fn root_dialog_id(&self) -> DialogId {
        Self::root(self.root_id.clone())
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str(&self.root_id)
        } else {
            write!(f, "{}#{}", self.root_id, self.self_id)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid dialog id: {0:?}")]
pub struct ParseDialogIdError(pub String);

impl FromStr for DialogId {
    type Err = ParseDialogIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('#') {
            None if !s.is_empty() => Ok(Self::root(s)),
            Some((root, sub)) if !root.is_empty() && !sub.is_empty() && !sub.contains('#') => {
                Ok(Self::sub(root, sub))
            }
            _ => Err(ParseDialogIdError(s.to_string())),
        }
    }
}
