use std::collections::BTreeSet;
use std::fmt::Write;

use phabreview_core::{ChangeGroup, ChangeKind, Hunk, LineRef, Revision};
use serde::{Deserialize, Serialize};

use crate::guidance::{guidance_block, GuidanceTag};
use crate::llm::ChatMessage;

/// Maximum numbered lines shown for a single hunk.
pub const MAX_SNIPPET_LINES: usize = 80;

const CHARS_PER_TOKEN: usize = 4;

const SYSTEM_PROMPT: &str = "\
You are an expert code reviewer for a legacy web application. You review \
Phabricator revisions whose backend is Python 2.7 and whose frontend uses \
AngularJS 1.x, jQuery, CSS/LESS and Jinja2 templates. Technology-specific \
rules for the files in each revision are listed under \"Review guidance\".

Rules that always apply:
1. CSS colors: hardcoded `#` color literals in CSS/LESS are forbidden. \
Colors live in `colors.less` and are referenced by variable name.
2. Magic values: flag magic numbers and hardcoded strings that encode \
configuration, limits or repeated values. They belong in shared constants \
reachable from HTML, CSS and JavaScript.
3. Tooltip text: tooltip strings must not be inlined in HTML or JS; define \
them as constants and reference them.
4. Duplicate constants: when the same constant value appears in several \
files, ask for a single shared definition.

Also look for:
- bugs, missing null/undefined checks and unhandled edge cases
- security problems (XSS, SQL injection, CSRF)
- poor error handling or unhelpful error messages
- duplicated code and inconsistent naming
- `print` or `console.log` left in production code
- TODO/FIXME comments that should be resolved first

Respond with a single JSON object and nothing else:
{
  \"summary\": [\"bullet point\", \"bullet point\"],
  \"requested_changes\": [
    {\"path\": \"app/views.py\", \"line\": 42, \"change\": \"what is wrong and how to fix it\"},
    {\"path\": \"static/app.js\", \"line\": \"15-20\", \"change\": \"issue spanning a line range\"}
  ]
}

- `summary`: one to three short bullets about the change as a whole.
- `requested_changes`: concrete issues; every item has `path`, `line` and `change`.
- `line` is a new-file line number (42) or an inclusive range (\"15-20\").
- If the code is fine, return an empty `requested_changes` and say so in the summary.
- Focus on real problems, not style nitpicks. Priority: bugs, then security, \
then maintainability, then style.";

const CLOSING_INSTRUCTION: &str = "\
Review the changes above and answer with the JSON object described in the \
system prompt. Use the new-file line numbers shown in the snippets.";

/// Build the system prompt sent with every review.
///
/// # Examples
///
/// ```
/// use phabreview_review::prompt::build_system_prompt;
///
/// let prompt = build_system_prompt();
/// assert!(prompt.contains("requested_changes"));
/// assert!(prompt.contains("colors.less"));
/// ```
pub fn build_system_prompt() -> String {
    SYSTEM_PROMPT.to_string()
}

/// Options controlling prompt assembly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComposeOptions {
    /// Token budget for the diff sections; `None` includes every hunk.
    pub max_diff_tokens: Option<usize>,
}

/// The two chat messages sent to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Reviewer persona, global rules and the response format.
    pub system: String,
    /// Revision metadata, changed files and the selected guidance.
    pub user: String,
}

impl Prompt {
    /// System message followed by the user message.
    pub fn messages(&self) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system.clone()),
            ChatMessage::user(self.user.clone()),
        ]
    }

    /// Rough token estimate for both messages.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system) + estimate_tokens(&self.user)
    }
}

/// Estimate tokens as characters divided by four, rounded up.
///
/// # Examples
///
/// ```
/// use phabreview_review::prompt::estimate_tokens;
///
/// assert_eq!(estimate_tokens(""), 0);
/// assert_eq!(estimate_tokens("abcde"), 2);
/// ```
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Assemble the review prompt.
///
/// The output is a pure function of the inputs. With a token budget, diff
/// sections are kept whole and in order while they fit; the rest are
/// dropped and counted in a trailing note.
///
/// # Examples
///
/// ```
/// use std::collections::BTreeSet;
/// use phabreview_core::{Revision, RevisionId};
/// use phabreview_difflens::parser::summarize;
/// use phabreview_review::guidance::select_guidance;
/// use phabreview_review::prompt::{compose, ComposeOptions};
///
/// let raw = "--- a/a.css\n+++ b/a.css\n@@ -1 +1 @@\n-a{color:red}\n+a{color:#fff}\n";
/// let revision = Revision {
///     id: RevisionId::parse("D1").unwrap(),
///     title: "Recolor links".into(),
///     author: "alice".into(),
///     status: "Needs Review".into(),
///     uri: "https://phab.example.com/D1".into(),
///     summary: String::new(),
///     diff_id: 1,
///     raw_diff: raw.into(),
/// };
/// let groups = summarize(raw);
/// let prompt = compose(&revision, &groups, &select_guidance(&groups), &ComposeOptions::default());
/// assert!(prompt.user.contains("### a.css (modify)"));
/// assert!(prompt.user.contains("### CSS / LESS"));
/// ```
pub fn compose(
    revision: &Revision,
    groups: &[ChangeGroup],
    guidance: &BTreeSet<GuidanceTag>,
    options: &ComposeOptions,
) -> Prompt {
    let mut parts = vec![revision_header(revision), changed_files(groups, options)];
    if !guidance.is_empty() {
        parts.push(review_guidance(guidance));
    }
    parts.push(CLOSING_INSTRUCTION.to_string());

    Prompt {
        system: build_system_prompt(),
        user: parts.join("\n\n"),
    }
}

fn revision_header(revision: &Revision) -> String {
    let mut out = format!(
        "## Revision {}: {}\nAuthor: {}\nStatus: {}\nURI: {}",
        revision.id, revision.title, revision.author, revision.status, revision.uri
    );
    let description = revision.summary.trim();
    if !description.is_empty() {
        let _ = write!(out, "\n\nDescription:\n{description}");
    }
    out
}

fn changed_files(groups: &[ChangeGroup], options: &ComposeOptions) -> String {
    let mut out = String::from("## Changed files");
    if groups.is_empty() {
        out.push_str("\n\n(the diff contains no file changes)");
        return out;
    }

    let limit = options
        .max_diff_tokens
        .map(|tokens| tokens.saturating_mul(CHARS_PER_TOKEN));
    let mut used = 0usize;
    let mut omitted = 0usize;

    for group in groups {
        out.push_str("\n\n");
        out.push_str(&group_heading(group));

        for section in diff_sections(group) {
            let size = section.chars().count();
            let fits = match limit {
                None => true,
                Some(limit) => omitted == 0 && used + size <= limit,
            };
            if fits {
                used += size;
                out.push_str("\n\n");
                out.push_str(&section);
            } else {
                omitted += 1;
            }
        }
    }

    if omitted > 0 {
        tracing::debug!(omitted, "diff sections dropped to fit the token budget");
        let _ = write!(
            out,
            "\n\n[{omitted} hunk(s) omitted to fit the context limit]"
        );
    }
    out
}

fn group_heading(group: &ChangeGroup) -> String {
    let name = if group.path.is_empty() {
        "(text outside any file)"
    } else {
        group.path.as_str()
    };
    let mut out = format!("### {name} ({})", group.kind);

    if let Some(old) = &group.old_path {
        let _ = write!(out, "\nRenamed from: {old}");
    }
    if group.is_binary {
        out.push_str("\nBinary file; content not shown.");
    }
    if group.kind == ChangeKind::Delete {
        out.push_str("\nThe file is deleted.");
    }

    let runs = group.change_runs();
    if !runs.is_empty() {
        let labels: Vec<String> = runs
            .iter()
            .map(|r| format!("{} {}", r.kind, r.lines.label()))
            .collect();
        let _ = write!(out, "\nChanges: {}", labels.join("; "));
    }
    out
}

/// Hunks and the unparsed block of one group, each rendered whole.
fn diff_sections(group: &ChangeGroup) -> Vec<String> {
    let mut sections: Vec<String> = group.hunks.iter().map(hunk_section).collect();
    if !group.unparsed.is_empty() && !group.is_binary {
        sections.push(format!(
            "Unparsed diff text:\n```\n{}\n```",
            group.unparsed.join("\n")
        ));
    }
    sections
}

fn hunk_section(hunk: &Hunk) -> String {
    let numbered = hunk.numbered_lines();
    let mut out = format!("```\n{}", hunk.header());

    for (line, diff_line) in numbered.iter().zip(&hunk.lines).take(MAX_SNIPPET_LINES) {
        let old = line.old.map(|n| n.to_string()).unwrap_or_default();
        let new = line.new.map(|n| n.to_string()).unwrap_or_default();
        let _ = write!(out, "\n{old:>5} {new:>5} {}", diff_line.raw);
    }

    let elided = numbered.len().saturating_sub(MAX_SNIPPET_LINES);
    if elided > 0 {
        let _ = write!(out, "\n... {elided} more line(s) not shown");
    }
    out.push_str("\n```");
    out
}

fn review_guidance(guidance: &BTreeSet<GuidanceTag>) -> String {
    let mut out = String::from("## Review guidance");
    for tag in guidance {
        let block = guidance_block(*tag);
        let _ = write!(out, "\n\n### {}\n{}", block.title, block.rules);
    }
    out
}

/// Structured review parsed from the model's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReviewFindings {
    /// Overall summary bullets.
    pub summary: Vec<String>,
    /// Concrete change requests.
    pub requested_changes: Vec<RequestedChange>,
}

/// One change the reviewer asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestedChange {
    /// File path as given by the model.
    pub path: String,
    /// Referenced line(s); `None` when the model gave none or an unusable one.
    pub line: Option<LineRef>,
    /// Description of the issue and the fix.
    pub change: String,
}

#[derive(Deserialize)]
struct RawFindings {
    #[serde(default)]
    summary: serde_json::Value,
    #[serde(default)]
    requested_changes: Vec<RawChange>,
}

#[derive(Deserialize)]
struct RawChange {
    #[serde(default)]
    path: String,
    #[serde(default)]
    line: serde_json::Value,
    #[serde(default)]
    change: String,
}

/// Parse the model's answer into [`ReviewFindings`].
///
/// Markdown code fences are stripped. If no JSON object of the expected
/// shape can be found, the whole answer becomes the only summary bullet.
///
/// # Examples
///
/// ```
/// use phabreview_review::prompt::parse_review_response;
///
/// let findings = parse_review_response(
///     r#"{"summary": ["Looks fine"], "requested_changes": [{"path": "a.py", "line": "3-4", "change": "Use a constant"}]}"#,
/// );
/// assert_eq!(findings.summary, vec!["Looks fine"]);
/// assert_eq!(findings.requested_changes[0].line.unwrap().to_string(), "3-4");
///
/// let fallback = parse_review_response("The change looks good.");
/// assert_eq!(fallback.summary, vec!["The change looks good."]);
/// assert!(fallback.requested_changes.is_empty());
/// ```
pub fn parse_review_response(response: &str) -> ReviewFindings {
    let cleaned = strip_code_fences(response);

    let parsed = serde_json::from_str::<RawFindings>(cleaned).or_else(|e| {
        let start = cleaned.find('{');
        let end = cleaned.rfind('}');
        match (start, end) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str::<RawFindings>(&cleaned[start..=end])
            }
            _ => Err(e),
        }
    });

    let raw = match parsed {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(error = %e, "review response is not JSON, using it as the summary");
            let text = response.trim();
            let bullet = if text.is_empty() {
                "(model returned empty response)".to_string()
            } else {
                text.to_string()
            };
            return ReviewFindings {
                summary: vec![bullet],
                requested_changes: Vec::new(),
            };
        }
    };

    let summary = match raw.summary {
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        serde_json::Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    };

    let requested_changes = raw
        .requested_changes
        .into_iter()
        .filter(|c| !c.change.trim().is_empty())
        .map(|c| RequestedChange {
            path: c.path.trim().to_string(),
            line: parse_line(&c.line),
            change: c.change.trim().to_string(),
        })
        .collect();

    ReviewFindings {
        summary,
        requested_changes,
    }
}

fn parse_line(value: &serde_json::Value) -> Option<LineRef> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .map(LineRef::single),
        serde_json::Value::String(s) => s.parse().ok().filter(|r: &LineRef| r.start > 0),
        _ => None,
    }
}

fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening fence line.
    match inner.split_once('\n') {
        Some((info, body)) if !info.trim_start().starts_with('{') => body.trim(),
        _ => inner.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phabreview_core::RevisionId;
    use phabreview_difflens::parser::summarize;

    const DIFF: &str = "\
diff --git a/app/views.py b/app/views.py
--- a/app/views.py
+++ b/app/views.py
@@ -10,3 +10,4 @@ def index(request):
     user = request.user
+    print user.name
     return render(user)

diff --git a/static/site.css b/static/site.css
--- a/static/site.css
+++ b/static/site.css
@@ -1,2 +1,2 @@
-a { color: @link; }
+a { color: #0066cc; }
 b { font-weight: bold; }
";

    fn revision(summary: &str) -> Revision {
        Revision {
            id: RevisionId::parse("D33113").unwrap(),
            title: "Tweak index view".into(),
            author: "alice".into(),
            status: "Needs Review".into(),
            uri: "https://phab.example.com/D33113".into(),
            summary: summary.into(),
            diff_id: 9,
            raw_diff: DIFF.into(),
        }
    }

    fn compose_default(groups: &[ChangeGroup]) -> Prompt {
        let guidance = crate::guidance::select_guidance(groups);
        compose(&revision(""), groups, &guidance, &ComposeOptions::default())
    }

    #[test]
    fn prompt_sections_appear_in_order() {
        let groups = summarize(DIFF);
        let prompt = compose_default(&groups);
        let user = &prompt.user;

        let header = user.find("## Revision D33113: Tweak index view").unwrap();
        let files = user.find("## Changed files").unwrap();
        let py = user.find("### app/views.py (modify)").unwrap();
        let css = user.find("### static/site.css (modify)").unwrap();
        let guidance = user.find("## Review guidance").unwrap();
        assert!(header < files && files < py && py < css && css < guidance);
        assert!(user.ends_with(CLOSING_INSTRUCTION));
        assert!(user.contains("Changes: Added line 11"));
        assert!(user.contains("   11 +    print user.name"));
        assert!(!user.contains("Description:"));
    }

    #[test]
    fn guidance_blocks_appear_once_in_tag_order() {
        let groups = summarize(DIFF);
        let user = compose_default(&groups).user;
        assert_eq!(user.matches("### Python 2.7").count(), 1);
        assert_eq!(user.matches("### CSS / LESS").count(), 1);
        assert!(user.find("### Python 2.7").unwrap() < user.find("### CSS / LESS").unwrap());
        assert!(!user.contains("### jQuery"));
    }

    #[test]
    fn description_is_included_when_present() {
        let groups = summarize(DIFF);
        let guidance = crate::guidance::select_guidance(&groups);
        let prompt = compose(
            &revision("Prints the user name."),
            &groups,
            &guidance,
            &ComposeOptions::default(),
        );
        assert!(prompt.user.contains("Description:\nPrints the user name."));
    }

    #[test]
    fn composition_is_deterministic() {
        let groups = summarize(DIFF);
        assert_eq!(compose_default(&groups), compose_default(&groups));
    }

    #[test]
    fn token_budget_drops_whole_hunks() {
        let groups = summarize(DIFF);
        let guidance = crate::guidance::select_guidance(&groups);
        let first_hunk = hunk_section(&groups[0].hunks[0]);
        let budget = estimate_tokens(&first_hunk) + 1;

        let prompt = compose(
            &revision(""),
            &groups,
            &guidance,
            &ComposeOptions {
                max_diff_tokens: Some(budget),
            },
        );
        assert!(prompt.user.contains(&first_hunk));
        assert!(!prompt.user.contains("#0066cc"));
        assert!(prompt.user.contains("### static/site.css (modify)"));
        assert!(prompt
            .user
            .contains("[1 hunk(s) omitted to fit the context limit]"));
    }

    #[test]
    fn zero_budget_omits_every_hunk() {
        let groups = summarize(DIFF);
        let prompt = compose(
            &revision(""),
            &groups,
            &BTreeSet::new(),
            &ComposeOptions {
                max_diff_tokens: Some(0),
            },
        );
        assert!(prompt.user.contains("[2 hunk(s) omitted"));
        assert!(!prompt.user.contains("## Review guidance"));
    }

    #[test]
    fn long_hunks_are_cut_at_line_boundaries() {
        let mut raw = String::from("--- a/big.py\n+++ b/big.py\n@@ -0,0 +1,100 @@\n");
        for i in 1..=100 {
            let _ = writeln!(raw, "+x{i} = {i}");
        }
        let groups = summarize(&raw);
        let section = hunk_section(&groups[0].hunks[0]);
        assert!(section.contains("+x80 = 80"));
        assert!(!section.contains("+x81 = 81"));
        assert!(section.contains("... 20 more line(s) not shown"));
    }

    #[test]
    fn unparsed_text_is_fenced_verbatim() {
        let raw = "Summary: tweak\n--- a/a.py\n+++ b/a.py\n@@ -1 +1 @@\n-a\n+b\n";
        let groups = summarize(raw);
        let user = compose_default(&groups).user;
        assert!(user.contains("### (text outside any file) (unparsed)"));
        assert!(user.contains("Unparsed diff text:\n```\nSummary: tweak\n```"));
    }

    #[test]
    fn empty_diff_is_stated() {
        let user = compose_default(&[]).user;
        assert!(user.contains("(the diff contains no file changes)"));
    }

    #[test]
    fn messages_are_system_then_user() {
        let groups = summarize(DIFF);
        let messages = compose_default(&groups).messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, crate::llm::Role::System);
        assert_eq!(messages[1].role, crate::llm::Role::User);
    }

    #[test]
    fn parse_fenced_json_with_int_and_range_lines() {
        let response = "```json\n{\n  \"summary\": [\"Adds a debug print\"],\n  \"requested_changes\": [\n    {\"path\": \"app/views.py\", \"line\": 11, \"change\": \"Remove the print statement\"},\n    {\"path\": \"static/site.css\", \"line\": \"1-2\", \"change\": \"Use a colors.less variable\"}\n  ]\n}\n```";
        let findings = parse_review_response(response);
        assert_eq!(findings.summary, vec!["Adds a debug print"]);
        assert_eq!(findings.requested_changes.len(), 2);
        assert_eq!(findings.requested_changes[0].line, Some(LineRef::single(11)));
        assert_eq!(
            findings.requested_changes[1].line,
            Some(LineRef { start: 1, end: 2 })
        );
    }

    #[test]
    fn parse_accepts_string_summary_and_json_inside_prose() {
        let response = "Here is my review:\n{\"summary\": \"All good\", \"requested_changes\": []}\nThanks!";
        let findings = parse_review_response(response);
        assert_eq!(findings.summary, vec!["All good"]);
        assert!(findings.requested_changes.is_empty());
    }

    #[test]
    fn parse_keeps_changes_with_unusable_line() {
        let response = r#"{"summary": [], "requested_changes": [{"path": "a.js", "line": "top", "change": "Cache the selector"}]}"#;
        let findings = parse_review_response(response);
        assert_eq!(findings.requested_changes[0].line, None);
        assert_eq!(findings.requested_changes[0].change, "Cache the selector");
    }

    #[test]
    fn parse_falls_back_to_raw_text() {
        let findings = parse_review_response("  Nothing to flag here.  ");
        assert_eq!(findings.summary, vec!["Nothing to flag here."]);
        assert!(findings.requested_changes.is_empty());
    }

    #[test]
    fn non_object_json_falls_back_to_raw_text() {
        let findings = parse_review_response("[1, 2, 3]");
        assert_eq!(findings.summary, vec!["[1, 2, 3]"]);
    }
}
