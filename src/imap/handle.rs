use std::fmt;

/// Tag correlating one sent command with its tagged completion.
///
/// Handles are only unique within the lifetime of a single connection, so the
/// dispatcher always keys them together with the connection they were issued on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandHandle(String);

impl CommandHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wrap a tag as it appeared on the wire
    pub(crate) fn from_wire(tag: &str) -> Self {
        CommandHandle(tag.to_string())
    }
}

impl fmt::Display for CommandHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-connection tag source: `A1`, `A2`, ...
#[derive(Debug)]
pub struct TagGenerator {
    next: u32,
}

impl TagGenerator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_handle(&mut self) -> CommandHandle {
        let handle = CommandHandle(format!("A{}", self.next));
        self.next += 1;
        handle
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_sequential_and_unique() {
        let mut tags = TagGenerator::new();
        let a = tags.next_handle();
        let b = tags.next_handle();
        assert_eq!(a.as_str(), "A1");
        assert_eq!(b.as_str(), "A2");
        assert_ne!(a, b);
        assert_eq!(CommandHandle::from_wire("A2"), b);
    }
}
