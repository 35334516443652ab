use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use super::{ItemId, WorkItem};

/// Reads dependency references and claimed resources out of a work item.
pub trait DependencyExtractor: Send + Sync {
    /// Ids this item waits on, deduplicated, excluding itself.
    fn dependencies(&self, item: &WorkItem) -> Vec<ItemId>;

    /// Resource tokens such as `developer:alice` or `file:src/lib.rs`.
    fn resources(&self, item: &WorkItem) -> Vec<String>;
}

static DEPENDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:depends\s+on|blocked\s+by|requires)\s+#(\d+)").expect("valid regex")
});

static FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s`'(\[])((?:[\w.-]+/)*[\w-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|rb|toml|json|ya?ml|md|sql|css|html|sh))\b",
    )
    .expect("valid regex")
});

/// Free-text extractor: `depends on #N` style references and file names with
/// a known extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexExtractor;

impl DependencyExtractor for RegexExtractor {
    fn dependencies(&self, item: &WorkItem) -> Vec<ItemId> {
        let text = item.text();
        let deps: BTreeSet<ItemId> = DEPENDS_RE
            .captures_iter(&text)
            .filter_map(|caps| caps[1].parse().ok())
            .filter(|id| *id != item.id)
            .collect();
        deps.into_iter().collect()
    }

    fn resources(&self, item: &WorkItem) -> Vec<String> {
        let mut resources = BTreeSet::new();
        if let Some(who) = item.assignee.as_deref().filter(|w| !w.is_empty()) {
            resources.insert(format!("developer:{}", who));
        }
        for caps in FILE_RE.captures_iter(&item.text()) {
            resources.insert(format!("file:{}", &caps[1]));
        }
        resources.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_from_text() {
        let item = WorkItem::new(4, "Wire login").body(
            "Depends on #2 and depends on #3.\nAlso blocked by #2. Requires #9. See #7 for context.",
        );
        assert_eq!(RegexExtractor.dependencies(&item), vec![2, 3, 9]);
    }

    #[test]
    fn test_self_reference_ignored() {
        let item = WorkItem::new(5, "depends on #5");
        assert!(RegexExtractor.dependencies(&item).is_empty());
    }

    #[test]
    fn test_resources_include_assignee_and_files() {
        let item = WorkItem::new(1, "Refactor auth")
            .body("Touches src/auth/mod.rs and `Cargo.toml`, e.g. the deps.")
            .assignee("alice");
        assert_eq!(
            RegexExtractor.resources(&item),
            vec![
                "developer:alice".to_string(),
                "file:Cargo.toml".to_string(),
                "file:src/auth/mod.rs".to_string(),
            ]
        );
    }

    #[test]
    fn test_no_resources() {
        let item = WorkItem::new(1, "Think about it");
        assert!(RegexExtractor.resources(&item).is_empty());
    }
}
