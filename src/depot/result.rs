//! Command results: ordered text and tagged records plus typed views.
//!
//! A result aggregates two lazy sequences produced while a command runs:
//! console text lines (stdout/stderr with a severity level) and tagged
//! records (string field maps). Commands that failed carry at least one
//! stderr line. Typed accessors for the well-known record shapes (`fstat`,
//! `sizes`, `diff2`, `client`, `changes`, `info`) are thin views over the
//! underlying tag maps.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::RegexBuilder;

use super::command::{CommandHandler, PromptCallback};

/// Console output channel of one text record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DepotChannel {
    StdOut,
    StdErr,
}

/// One console text record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepotText {
    pub channel: DepotChannel,
    pub level: i32,
    pub value: String,
}

/// One tagged record: a mapping from field name to string value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepotTag {
    fields: HashMap<String, String>,
}

impl DepotTag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self { fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect() }
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn get_i32(&self, key: &str) -> i32 {
        self.get(key).trim().parse().unwrap_or(0)
    }

    pub fn get_i64(&self, key: &str) -> i64 {
        self.get(key).trim().parse().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Aggregated output of one depot command.
#[derive(Debug, Clone, Default)]
pub struct DepotResult {
    texts: Vec<DepotText>,
    tags: Vec<DepotTag>,
}

impl DepotResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, channel: DepotChannel, level: i32, value: impl Into<String>) {
        self.texts.push(DepotText { channel, level, value: value.into() });
    }

    pub fn push_tag(&mut self, tag: DepotTag) {
        self.tags.push(tag);
    }

    /// Marks the result failed with a synthesized stderr record.
    pub fn set_error(&mut self, text: impl Into<String>) {
        self.push_text(DepotChannel::StdErr, 0, text);
    }

    pub fn texts(&self) -> &[DepotText] {
        &self.texts
    }

    pub fn tags(&self) -> &[DepotTag] {
        &self.tags
    }

    /// A command is failed iff it produced any stderr text.
    pub fn has_error(&self) -> bool {
        self.texts.iter().any(|t| t.channel == DepotChannel::StdErr)
    }

    /// Case-insensitive regex match over the stderr lines.
    pub fn has_error_regex(&self, pattern: &str) -> bool {
        let Ok(re) = RegexBuilder::new(pattern).case_insensitive(true).build() else {
            return false;
        };
        self.texts
            .iter()
            .filter(|t| t.channel == DepotChannel::StdErr)
            .any(|t| re.is_match(&t.value))
    }

    /// All stderr text joined into one message.
    pub fn error_text(&self) -> String {
        self.text(DepotChannel::StdErr)
    }

    pub fn text(&self, channel: DepotChannel) -> String {
        self.texts
            .iter()
            .filter(|t| t.channel == channel)
            .map(|t| t.value.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// First occurrence of a tag field across all records.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| t.get_opt(key))
    }

    pub fn node_count(&self) -> usize {
        self.tags.len()
    }

    pub fn node(&self, index: usize) -> Option<&DepotTag> {
        self.tags.get(index)
    }
}

/// Result collector used for ordinary commands: stores everything and
/// answers prompts via the command's callback.
pub struct ResultCollector {
    pub result: DepotResult,
    prompt: Option<PromptCallback>,
}

impl ResultCollector {
    pub fn new(prompt: Option<PromptCallback>) -> Self {
        Self { result: DepotResult::new(), prompt }
    }
}

#[async_trait]
impl CommandHandler for ResultCollector {
    async fn on_text(&mut self, channel: DepotChannel, level: i32, text: &str) {
        self.result.push_text(channel, level, text);
    }

    async fn on_tag(&mut self, tag: DepotTag) {
        self.result.push_tag(tag);
    }

    async fn on_binary(&mut self, data: &[u8]) -> std::io::Result<()> {
        // Print-family content arriving without a dedicated stream handler
        // is kept as stdout text.
        self.result.push_text(DepotChannel::StdOut, 0, String::from_utf8_lossy(data));
        Ok(())
    }

    async fn on_prompt(&mut self, message: &str) -> Option<String> {
        self.prompt.as_ref().and_then(|p| p(message))
    }
}

/// `fstat` record view.
#[derive(Debug, Copy, Clone)]
pub struct FstatNode<'a>(pub &'a DepotTag);

impl FstatNode<'_> {
    pub fn depot_file(&self) -> &str {
        self.0.get("depotFile")
    }

    pub fn client_file(&self) -> &str {
        self.0.get("clientFile")
    }

    pub fn have_rev(&self) -> i32 {
        self.0.get_i32("haveRev")
    }

    pub fn head_rev(&self) -> i32 {
        self.0.get_i32("headRev")
    }

    pub fn head_type(&self) -> &str {
        self.0.get("headType")
    }

    pub fn file_size(&self) -> i64 {
        self.0.get_i64("fileSize")
    }
}

/// `sizes` record view.
#[derive(Debug, Copy, Clone)]
pub struct SizesNode<'a>(pub &'a DepotTag);

impl SizesNode<'_> {
    pub fn depot_file(&self) -> &str {
        self.0.get("depotFile")
    }

    pub fn file_size(&self) -> i64 {
        self.0.get_i64("fileSize")
    }
}

/// `diff2` record view: the have/head file pair and their types.
#[derive(Debug, Copy, Clone)]
pub struct Diff2Node<'a>(pub &'a DepotTag);

impl Diff2Node<'_> {
    pub fn depot_file(&self) -> &str {
        self.0.get("depotFile")
    }

    pub fn depot_file2(&self) -> &str {
        self.0.get("depotFile2")
    }

    pub fn file_type(&self) -> &str {
        self.0.get("type")
    }

    pub fn file_type2(&self) -> &str {
        self.0.get("type2")
    }
}

/// `client -o` spec view.
#[derive(Debug, Copy, Clone)]
pub struct ClientNode<'a>(pub &'a DepotTag);

impl ClientNode<'_> {
    pub fn access(&self) -> &str {
        self.0.get("Access")
    }

    pub fn owner(&self) -> &str {
        self.0.get("Owner")
    }

    pub fn root(&self) -> &str {
        self.0.get("Root")
    }

    pub fn line_end(&self) -> &str {
        self.0.get("LineEnd")
    }

    pub fn options(&self) -> &str {
        self.0.get("Options")
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options().split_whitespace().any(|o| o.eq_ignore_ascii_case(name))
    }

    /// `clobber` option: writable files may be overwritten by sync.
    pub fn is_clobber(&self) -> bool {
        self.has_option("clobber")
    }

    /// `allwrite` option: synced files are left writable.
    pub fn is_all_write(&self) -> bool {
        self.has_option("allwrite")
    }
}

/// `changes -m 1` record view.
#[derive(Debug, Copy, Clone)]
pub struct ChangesNode<'a>(pub &'a DepotTag);

impl ChangesNode<'_> {
    pub fn change(&self) -> i32 {
        self.0.get_i32("change")
    }
}

/// `info` record view.
#[derive(Debug, Copy, Clone)]
pub struct InfoNode<'a>(pub &'a DepotTag);

impl InfoNode<'_> {
    pub fn server_address(&self) -> &str {
        self.0.get("serverAddress")
    }

    pub fn user_name(&self) -> &str {
        self.0.get("userName")
    }

    pub fn client_name(&self) -> &str {
        self.0.get("clientName")
    }

    pub fn unicode(&self) -> bool {
        self.0.get("unicode") == "enabled"
    }

    pub fn case_handling(&self) -> &str {
        self.0.get("caseHandling")
    }
}

/// Returns true for a Perforce file type with the always-writable modifier,
/// e.g. `text+w` or `binary+Sw`.
pub fn is_writable_file_type(file_type: &str) -> bool {
    match file_type.split_once('+') {
        Some((_, modifiers)) => modifiers.contains('w'),
        None => false,
    }
}

/// Returns true for the symlink base file type.
pub fn is_symlink_file_type(file_type: &str) -> bool {
    file_type.split('+').next().is_some_and(|base| base.eq_ignore_ascii_case("symlink"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_error_surface() {
        let mut result = DepotResult::new();
        result.push_text(DepotChannel::StdOut, 0, "//depot/a.cpp#3 - added as c:\\w\\a.cpp");
        assert!(!result.has_error());

        result.push_text(DepotChannel::StdErr, 0, "Perforce password (P4PASSWD) invalid or unset.");
        assert!(result.has_error());
        assert!(result.has_error_regex("password .* invalid"));
        assert!(!result.has_error_regex("use the 'p4 trust' command"));
    }

    #[test]
    fn test_tag_access() {
        let tag = DepotTag::from_fields([
            ("depotFile", "//depot/src/a.cpp"),
            ("rev", "3"),
            ("fileSize", "1768"),
        ]);
        assert_eq!(tag.get("depotFile"), "//depot/src/a.cpp");
        assert_eq!(tag.get_i32("rev"), 3);
        assert_eq!(tag.get_i64("fileSize"), 1768);
        assert_eq!(tag.get_i32("missing"), 0);
    }

    #[test]
    fn test_client_options() {
        let tag = DepotTag::from_fields([("Options", "noallwrite clobber nocompress")]);
        let node = ClientNode(&tag);
        assert!(node.is_clobber());
        assert!(!node.is_all_write());
    }

    #[test]
    fn test_file_type_predicates() {
        assert!(is_writable_file_type("text+w"));
        assert!(is_writable_file_type("binary+Sw"));
        assert!(!is_writable_file_type("text"));
        assert!(is_symlink_file_type("symlink"));
        assert!(!is_symlink_file_type("text+x"));
    }
}
