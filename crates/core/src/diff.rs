//! Line diff used to preview job descriptor changes.
//!
//! Both sides are rendered to canonical JSON (two-space indent) and compared
//! positionally: line `i` of the old text against line `i` of the new text.
//! This is not a minimal edit script. An inserted or removed line shifts
//! every later line and they all report as changed. The descriptors compared
//! here share one template, so their renderings stay aligned in practice.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job_spec::JobDescriptor;

/// How one line of the old text compares to the same line of the new text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineDiffKind {
    Equal,
    Changed,
}

impl LineDiffKind {
    /// String representation for display and logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "equal",
            Self::Changed => "changed",
        }
    }
}

impl std::fmt::Display for LineDiffKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One aligned pair of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub line_index: usize,
    pub kind: LineDiffKind,
    pub old_line: String,
    pub new_line: String,
}

/// Ordered line-by-line comparison of two texts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffRecord {
    pub lines: Vec<DiffLine>,
}

impl DiffRecord {
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn changed_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.kind == LineDiffKind::Changed)
            .count()
    }

    pub fn has_changes(&self) -> bool {
        self.changed_count() > 0
    }

    /// Plain-text preview: unchanged lines are indented by two spaces,
    /// changed lines become a `- old` / `+ new` pair.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line.kind {
                LineDiffKind::Equal => {
                    out.push_str("  ");
                    out.push_str(&line.old_line);
                    out.push('\n');
                }
                LineDiffKind::Changed => {
                    out.push_str("- ");
                    out.push_str(&line.old_line);
                    out.push('\n');
                    out.push_str("+ ");
                    out.push_str(&line.new_line);
                    out.push('\n');
                }
            }
        }
        out
    }
}

/// Compare two texts line by line. The shorter side is padded with empty
/// lines up to the length of the longer one.
pub fn diff_text(old: &str, new: &str) -> DiffRecord {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let max_len = old_lines.len().max(new_lines.len());

    let lines = (0..max_len)
        .map(|i| {
            let old_line = old_lines.get(i).copied().unwrap_or("");
            let new_line = new_lines.get(i).copied().unwrap_or("");
            let kind = if old_line == new_line {
                LineDiffKind::Equal
            } else {
                LineDiffKind::Changed
            };
            DiffLine {
                line_index: i,
                kind,
                old_line: old_line.to_string(),
                new_line: new_line.to_string(),
            }
        })
        .collect();

    DiffRecord { lines }
}

/// Compare the canonical renderings of two descriptors.
pub fn diff(old: &JobDescriptor, new: &JobDescriptor) -> Result<DiffRecord, CoreError> {
    let old_json = old.to_canonical_json()?;
    let new_json = new.to_canonical_json()?;
    Ok(diff_text(&old_json, &new_json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_spec::{build, RESOURCE_KEY_CPU, RESOURCE_KEY_GPU};

    #[test]
    fn identical_descriptors_are_all_equal() {
        let d = JobDescriptor::baseline();
        let record = diff(&d, &d).unwrap();
        let line_count = d.to_canonical_json().unwrap().split('\n').count();

        assert_eq!(record.len(), line_count);
        assert!(record.lines.iter().all(|l| l.kind == LineDiffKind::Equal));
        assert!(!record.has_changes());
    }

    #[test]
    fn name_change_marks_only_name_line() {
        let old = JobDescriptor::baseline();
        let mut new = old.clone();
        new.metadata.name = "renamed".to_string();

        let record = diff(&old, &new).unwrap();
        let changed: Vec<&DiffLine> = record
            .lines
            .iter()
            .filter(|l| l.kind == LineDiffKind::Changed)
            .collect();

        assert_eq!(changed.len(), 1);
        assert!(changed[0].old_line.contains("\"quantum-job\""));
        assert!(changed[0].new_line.contains("\"renamed\""));
    }

    #[test]
    fn limits_key_swap_is_one_changed_line() {
        let old = JobDescriptor::baseline();
        let new = build(&old, &old.metadata.name, "cpu", None).unwrap();

        let record = diff(&old, &new).unwrap();
        assert_eq!(record.changed_count(), 1);
        let line = record
            .lines
            .iter()
            .find(|l| l.kind == LineDiffKind::Changed)
            .unwrap();
        assert!(line.old_line.contains(RESOURCE_KEY_GPU));
        assert!(line.new_line.contains(RESOURCE_KEY_CPU));
    }

    #[test]
    fn shorter_side_is_padded_with_empty_lines() {
        let record = diff_text("a\nb\nc", "a");
        assert_eq!(record.len(), 3);
        assert_eq!(record.lines[0].kind, LineDiffKind::Equal);
        assert_eq!(record.lines[2].old_line, "c");
        assert_eq!(record.lines[2].new_line, "");
        assert_eq!(record.lines[2].kind, LineDiffKind::Changed);
    }

    #[test]
    fn insertion_shifts_later_lines() {
        let record = diff_text("a\nb\nc", "x\na\nb\nc");
        assert_eq!(record.changed_count(), 4);
    }

    #[test]
    fn indices_follow_input_order() {
        let record = diff_text("1\n2\n3", "1\n2\n3");
        let indices: Vec<usize> = record.lines.iter().map(|l| l.line_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn render_marks_changed_pairs() {
        let record = diff_text("same\nold", "same\nnew");
        assert_eq!(record.render(), "  same\n- old\n+ new\n");
    }

    #[test]
    fn kind_display_matches_as_str() {
        assert_eq!(LineDiffKind::Equal.to_string(), "equal");
        assert_eq!(LineDiffKind::Changed.to_string(), "changed");
    }
}
