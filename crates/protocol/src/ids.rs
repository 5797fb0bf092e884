//! Generated resource identifiers.
//!
//! The worker names every resource it creates `<kind>_<n>` with `n` drawn
//! from one process-wide counter, except dialogs, which get
//! `dialog_<epoch-millis>_<suffix>` so they stay unique across the
//! unpredictable times at which pages raise them.

use std::fmt;

/// Kind tag embedded at the front of a generated resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Browser,
    Context,
    Page,
    Route,
    Response,
    Dialog,
    Server,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Browser => "browser",
            ResourceKind::Context => "context",
            ResourceKind::Page => "page",
            ResourceKind::Route => "route",
            ResourceKind::Response => "response",
            ResourceKind::Dialog => "dialog",
            ResourceKind::Server => "server",
        }
    }

    fn from_prefix(prefix: &str) -> Option<ResourceKind> {
        Some(match prefix {
            "browser" => ResourceKind::Browser,
            "context" => ResourceKind::Context,
            "page" => ResourceKind::Page,
            "route" => ResourceKind::Route,
            "response" => ResourceKind::Response,
            "dialog" => ResourceKind::Dialog,
            "server" => ResourceKind::Server,
            _ => return None,
        })
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of a generated id, judged by its prefix up to the first underscore.
pub fn kind_of(id: &str) -> Option<ResourceKind> {
    let (prefix, _) = id.split_once('_')?;
    ResourceKind::from_prefix(prefix)
}
