use crate::imap::CommandHandle;
use std::fmt;

/// IMAP response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    No,
    Bad,
    Preauth,
    Bye,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::No => write!(f, "NO"),
            ResponseStatus::Bad => write!(f, "BAD"),
            ResponseStatus::Preauth => write!(f, "PREAUTH"),
            ResponseStatus::Bye => write!(f, "BYE"),
        }
    }
}

impl ResponseStatus {
    pub fn from_str(status: &str) -> Option<Self> {
        match status.to_uppercase().as_str() {
            "OK" => Some(ResponseStatus::Ok),
            "NO" => Some(ResponseStatus::No),
            "BAD" => Some(ResponseStatus::Bad),
            "PREAUTH" => Some(ResponseStatus::Preauth),
            "BYE" => Some(ResponseStatus::Bye),
            _ => None,
        }
    }
}

/// IMAP capability flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapCapability {
    Imap4Rev1,
    StartTls,
    LoginDisabled,
    SaslIr,
    AuthPlain,
    AuthLogin,
    Idle,
    Namespace,
    Unselect,
    Children,
    UidPlus,
    CondStore,
    Custom(String),
}

impl ImapCapability {
    /// Parse capability string into ImapCapability enum
    pub fn from_str(capability: &str) -> Self {
        match capability.to_uppercase().as_str() {
            "IMAP4REV1" => ImapCapability::Imap4Rev1,
            "STARTTLS" => ImapCapability::StartTls,
            "LOGINDISABLED" => ImapCapability::LoginDisabled,
            "SASL-IR" => ImapCapability::SaslIr,
            "AUTH=PLAIN" => ImapCapability::AuthPlain,
            "AUTH=LOGIN" => ImapCapability::AuthLogin,
            "IDLE" => ImapCapability::Idle,
            "NAMESPACE" => ImapCapability::Namespace,
            "UNSELECT" => ImapCapability::Unselect,
            "CHILDREN" => ImapCapability::Children,
            "UIDPLUS" => ImapCapability::UidPlus,
            "CONDSTORE" => ImapCapability::CondStore,
            _ => ImapCapability::Custom(capability.to_string()),
        }
    }
}

/// IMAP folder attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderAttribute {
    Noinferiors,
    Noselect,
    Marked,
    Unmarked,
    HasChildren,
    HasNoChildren,
    NonExistent,
    Custom(String),
}

impl FolderAttribute {
    pub fn from_str(attr: &str) -> Self {
        match attr.to_uppercase().as_str() {
            "\\NOINFERIORS" => FolderAttribute::Noinferiors,
            "\\NOSELECT" => FolderAttribute::Noselect,
            "\\MARKED" => FolderAttribute::Marked,
            "\\UNMARKED" => FolderAttribute::Unmarked,
            "\\HASCHILDREN" => FolderAttribute::HasChildren,
            "\\HASNOCHILDREN" => FolderAttribute::HasNoChildren,
            "\\NONEXISTENT" => FolderAttribute::NonExistent,
            _ => FolderAttribute::Custom(attr.to_string()),
        }
    }
}

/// Items carried by a `STATUS` request/response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusItem {
    Messages,
    Recent,
    UidNext,
    UidValidity,
    Unseen,
}

impl StatusItem {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::Recent => "RECENT",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
        }
    }

    pub fn from_str(item: &str) -> Option<Self> {
        match item.to_uppercase().as_str() {
            "MESSAGES" => Some(StatusItem::Messages),
            "RECENT" => Some(StatusItem::Recent),
            "UIDNEXT" => Some(StatusItem::UidNext),
            "UIDVALIDITY" => Some(StatusItem::UidValidity),
            "UNSEEN" => Some(StatusItem::Unseen),
            _ => None,
        }
    }
}

/// Bracketed response code of a status response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseCode {
    Alert,
    Parse,
    ReadOnly,
    ReadWrite,
    TryCreate,
    Capability(Vec<ImapCapability>),
    UidNext(u32),
    UidValidity(u32),
    Unseen(u32),
    Other(String),
}

/// `OK`/`NO`/`BAD`/`PREAUTH`/`BYE`, tagged or untagged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub tag: Option<CommandHandle>,
    pub status: ResponseStatus,
    pub code: Option<ResponseCode>,
    pub text: String,
}

/// Untagged server data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UntaggedData {
    Capability(Vec<ImapCapability>),
    List {
        attributes: Vec<FolderAttribute>,
        delimiter: Option<String>,
        mailbox: String,
    },
    Status {
        mailbox: String,
        items: Vec<(StatusItem, u32)>,
    },
    Flags(Vec<String>),
    Search(Vec<u32>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch {
        sequence: u32,
        data: String,
    },
    Other {
        keyword: String,
        raw: String,
    },
}

/// One decoded response record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    State(State),
    Data(UntaggedData),
    Continuation(String),
}

/// Mailbox names are compared case-insensitively only for INBOX
pub fn same_mailbox(a: &str, b: &str) -> bool {
    if a.eq_ignore_ascii_case("INBOX") && b.eq_ignore_ascii_case("INBOX") {
        return true;
    }
    a == b
}
