//! Technology-specific review rules and the table that picks them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use phabreview_core::{ChangeGroup, LineKind};
use serde::Serialize;

/// Technology a guidance block applies to.
///
/// The derived ordering is the order blocks appear in the prompt.
///
/// # Examples
///
/// ```
/// use phabreview_review::guidance::GuidanceTag;
///
/// let tag: GuidanceTag = "angularjs".parse().unwrap();
/// assert_eq!(tag, GuidanceTag::AngularJs);
/// assert_eq!(tag.to_string(), "angularjs");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GuidanceTag {
    /// Python 2.7 backend code.
    Python2,
    /// AngularJS 1.x controllers, directives and templates.
    AngularJs,
    /// jQuery-style JavaScript.
    JQuery,
    /// CSS and LESS stylesheets.
    Css,
    /// Jinja2 templates.
    Jinja2,
}

impl GuidanceTag {
    /// Every tag, in prompt order.
    pub const ALL: [GuidanceTag; 5] = [
        GuidanceTag::Python2,
        GuidanceTag::AngularJs,
        GuidanceTag::JQuery,
        GuidanceTag::Css,
        GuidanceTag::Jinja2,
    ];

    /// Lowercase tag name.
    pub fn as_str(&self) -> &'static str {
        match self {
            GuidanceTag::Python2 => "python2",
            GuidanceTag::AngularJs => "angularjs",
            GuidanceTag::JQuery => "jquery",
            GuidanceTag::Css => "css",
            GuidanceTag::Jinja2 => "jinja2",
        }
    }
}

impl fmt::Display for GuidanceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GuidanceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GuidanceTag::ALL
            .into_iter()
            .find(|tag| tag.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown guidance tag: {s}"))
    }
}

/// A named set of review rules for one technology.
#[derive(Debug, PartialEq, Eq)]
pub struct GuidanceBlock {
    /// Tag the block is keyed by.
    pub tag: GuidanceTag,
    /// Heading shown above the rules in the prompt.
    pub title: &'static str,
    /// Rule bullets, one per line.
    pub rules: &'static str,
}

static GUIDANCE_BLOCKS: [GuidanceBlock; 5] = [
    GuidanceBlock {
        tag: GuidanceTag::Python2,
        title: "Python 2.7",
        rules: "\
- Check `unicode` versus `str` handling, especially when concatenating or formatting strings.
- `print` is a statement unless the module imports `from __future__ import print_function`.
- Exception syntax (`except Exception, e:` versus `except Exception as e:`) should match the surrounding code.
- Prefer `xrange` over `range` for large iterations.
- Verify `__future__` imports are present where the code relies on them.
- Compare with `None` using `is None` / `is not None`, never `== None`.
- Flag mutable default arguments such as `def foo(items=[])`.",
    },
    GuidanceBlock {
        tag: GuidanceTag::AngularJs,
        title: "AngularJS 1.x",
        rules: "\
- Dependency injection must use the array notation: `['$scope', 'Service', function($scope, Service) {}]`.
- Avoid polluting `$scope`; prefer the `controllerAs` syntax.
- DOM manipulation belongs in directives, not controllers.
- Async callbacks running outside Angular need `$scope.$apply()` or `$timeout`.
- Watchers registered with `$watch` must be cleaned up on `$destroy`.
- Do not share data through `$rootScope`; use a service.",
    },
    GuidanceBlock {
        tag: GuidanceTag::JQuery,
        title: "jQuery",
        rules: "\
- Flag deprecated methods: `.live()`, `.die()`, `.bind()`, `.unbind()`.
- Look for event handlers that are never unbound and leak memory.
- Cache selectors instead of repeating `$('.selector')` lookups.
- Flag synchronous AJAX calls.",
    },
    GuidanceBlock {
        tag: GuidanceTag::Css,
        title: "CSS / LESS",
        rules: "\
- Hardcoded `#` color literals (`#fff`, `#333333`) are never allowed. Every color must be defined in `colors.less` and referenced by its variable (e.g. `@primary-color`).
- Prefer existing variables and mixins over repeated literal values.",
    },
    GuidanceBlock {
        tag: GuidanceTag::Jinja2,
        title: "Jinja2 templates",
        rules: "\
- Output must be escaped (`|e`) where it can carry user input, to prevent XSS.
- Check macro usage and template inheritance (`extends`, `block`).
- User-facing strings and tooltip text must come from constants, not be inlined.
- Check conditional logic and loop handling.",
    },
];

/// Look up the static rule block for `tag`.
///
/// # Examples
///
/// ```
/// use phabreview_review::guidance::{guidance_block, GuidanceTag};
///
/// let block = guidance_block(GuidanceTag::Css);
/// assert!(block.rules.contains("colors.less"));
/// ```
pub fn guidance_block(tag: GuidanceTag) -> &'static GuidanceBlock {
    match tag {
        GuidanceTag::Python2 => &GUIDANCE_BLOCKS[0],
        GuidanceTag::AngularJs => &GUIDANCE_BLOCKS[1],
        GuidanceTag::JQuery => &GUIDANCE_BLOCKS[2],
        GuidanceTag::Css => &GUIDANCE_BLOCKS[3],
        GuidanceTag::Jinja2 => &GUIDANCE_BLOCKS[4],
    }
}

/// Extension to base tag. `.js` and template files are refined by content.
const EXTENSION_TAGS: &[(&str, GuidanceTag)] = &[
    ("py", GuidanceTag::Python2),
    ("js", GuidanceTag::JQuery),
    ("css", GuidanceTag::Css),
    ("less", GuidanceTag::Css),
    ("html", GuidanceTag::Jinja2),
    ("htm", GuidanceTag::Jinja2),
    ("jinja", GuidanceTag::Jinja2),
    ("jinja2", GuidanceTag::Jinja2),
    ("j2", GuidanceTag::Jinja2),
];

const ANGULAR_SCRIPT_MARKERS: &[&str] = &[
    "angular.module",
    "$scope",
    "$rootScope",
    ".controller(",
    ".directive(",
    ".factory(",
    ".service(",
    "$http",
];

const ANGULAR_TEMPLATE_MARKERS: &[&str] = &[" ng-", "\tng-", "<ng-", "data-ng-"];

/// Tags that apply to a single change group.
///
/// # Examples
///
/// ```
/// use phabreview_core::{ChangeGroup, ChangeKind};
/// use phabreview_review::guidance::{tags_for, GuidanceTag};
///
/// let group = ChangeGroup::new("static/Site.LESS", ChangeKind::Modify);
/// assert_eq!(tags_for(&group), vec![GuidanceTag::Css]);
/// ```
pub fn tags_for(group: &ChangeGroup) -> Vec<GuidanceTag> {
    let Some(ext) = group.extension() else {
        return Vec::new();
    };
    let Some(&(_, base)) = EXTENSION_TAGS.iter().find(|(e, _)| *e == ext) else {
        return Vec::new();
    };

    match base {
        GuidanceTag::JQuery if contains_any(group, ANGULAR_SCRIPT_MARKERS) => {
            vec![GuidanceTag::AngularJs]
        }
        GuidanceTag::Jinja2 if contains_any(group, ANGULAR_TEMPLATE_MARKERS) => {
            vec![GuidanceTag::AngularJs, GuidanceTag::Jinja2]
        }
        tag => vec![tag],
    }
}

/// Select the guidance tags for a set of change groups.
///
/// Pure function of the groups; the result is deduplicated and ordered
/// independently of input order.
///
/// # Examples
///
/// ```
/// use phabreview_core::{ChangeGroup, ChangeKind};
/// use phabreview_review::guidance::{select_guidance, GuidanceTag};
///
/// let groups = vec![
///     ChangeGroup::new("b.css", ChangeKind::Modify),
///     ChangeGroup::new("a.py", ChangeKind::Add),
///     ChangeGroup::new("c.css", ChangeKind::Modify),
/// ];
/// let tags: Vec<_> = select_guidance(&groups).into_iter().collect();
/// assert_eq!(tags, vec![GuidanceTag::Python2, GuidanceTag::Css]);
/// ```
pub fn select_guidance(groups: &[ChangeGroup]) -> BTreeSet<GuidanceTag> {
    groups.iter().flat_map(tags_for).collect()
}

/// Whether any hunk line or unparsed line of the group contains a marker.
fn contains_any(group: &ChangeGroup, markers: &[&str]) -> bool {
    let hunk_text = group
        .hunks
        .iter()
        .flat_map(|h| h.lines.iter())
        .filter(|l| l.kind != LineKind::NoNewline)
        .map(|l| l.text());
    let unparsed = group.unparsed.iter().map(String::as_str);

    hunk_text
        .chain(unparsed)
        .any(|line| markers.iter().any(|m| line.contains(m)))
}
