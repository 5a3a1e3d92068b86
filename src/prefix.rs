/// Table Prefix Resolver
///
/// Maps bare table names to tenant-scoped names. Tenant 0 and 1 share the
/// base prefix; tenant N uses `base + N + "_"`. Global tables always use the
/// base prefix.

use crate::core::{DbError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

static PREFIX_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

/// Rejects prefixes with characters outside `[A-Za-z0-9_]`.
pub fn validate_prefix(prefix: &str) -> Result<()> {
    if PREFIX_PATTERN.is_match(prefix) {
        Ok(())
    } else {
        Err(DbError::InvalidPrefix(prefix.to_string()))
    }
}

/// Which group of tables to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableScope {
    /// Global plus per-tenant tables (plus network tables when multi-tenant)
    All,
    /// Per-tenant tables
    Blog,
    /// Global tables (plus network tables when multi-tenant)
    Global,
    /// Network tables only
    MsGlobal,
    /// Deprecated tables
    Old,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Bare table names per group.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TableSets {
    pub blog: Vec<String>,
    pub old: Vec<String>,
    pub global: Vec<String>,
    pub ms_global: Vec<String>,
    pub old_ms_global: Vec<String>,
}

impl Default for TableSets {
    fn default() -> Self {
        TableSets {
            blog: names(&[
                "posts",
                "comments",
                "links",
                "options",
                "postmeta",
                "terms",
                "term_taxonomy",
                "term_relationships",
                "termmeta",
                "commentmeta",
            ]),
            old: names(&["categories", "post2cat", "link2cat"]),
            global: names(&["users", "usermeta"]),
            ms_global: names(&["blogs", "blogmeta", "signups", "site", "sitemeta", "registration_log"]),
            old_ms_global: names(&["sitecategories"]),
        }
    }
}

/// Resolves tenant-scoped table names.
#[derive(Debug, Clone)]
pub struct TablePrefixResolver {
    base_prefix: String,
    prefix: String,
    blog_id: u64,
    site_id: u64,
    multisite: bool,
    sets: TableSets,
    custom_user_table: Option<String>,
    custom_user_meta_table: Option<String>,
    resolved: HashMap<String, String>,
}

impl TablePrefixResolver {
    pub fn new(base_prefix: &str, multisite: bool, sets: TableSets) -> Result<Self> {
        let mut resolver = TablePrefixResolver {
            base_prefix: String::new(),
            prefix: String::new(),
            blog_id: 0,
            site_id: 0,
            multisite,
            sets,
            custom_user_table: None,
            custom_user_meta_table: None,
            resolved: HashMap::new(),
        };
        resolver.set_prefix(base_prefix)?;
        Ok(resolver)
    }

    /// Overrides the resolved names of `users` and `usermeta`.
    pub fn with_custom_user_tables(mut self, users: Option<String>, usermeta: Option<String>) -> Self {
        self.custom_user_table = users;
        self.custom_user_meta_table = usermeta;
        self.refresh_global();
        self
    }

    pub fn base_prefix(&self) -> &str {
        &self.base_prefix
    }

    /// Prefix of the current tenant.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn blog_id(&self) -> u64 {
        self.blog_id
    }

    pub fn site_id(&self) -> u64 {
        self.site_id
    }

    pub fn is_multisite(&self) -> bool {
        self.multisite
    }

    /// Sets the base prefix and recomputes table names.
    /// Returns the previous base prefix.
    pub fn set_prefix(&mut self, prefix: &str) -> Result<String> {
        validate_prefix(prefix)?;
        let old = std::mem::replace(&mut self.base_prefix, prefix.to_string());

        self.refresh_global();
        if self.multisite && self.blog_id == 0 {
            return Ok(old);
        }
        self.refresh_blog();
        debug!(prefix, "Table prefix set");
        Ok(old)
    }

    /// Switches tenant (and optionally network). Returns the previous tenant id.
    pub fn set_blog_id(&mut self, blog_id: u64, network_id: Option<u64>) -> u64 {
        if let Some(network_id) = network_id.filter(|&id| id != 0) {
            self.site_id = network_id;
        }
        let old = std::mem::replace(&mut self.blog_id, blog_id);
        self.refresh_blog();
        debug!(blog_id, prefix = %self.prefix, "Switched tenant");
        old
    }

    /// Prefix for `blog_id`, or the current tenant when `None`.
    pub fn blog_prefix(&self, blog_id: Option<u64>) -> String {
        match blog_id.unwrap_or(self.blog_id) {
            0 | 1 => self.base_prefix.clone(),
            id => format!("{}{}_", self.base_prefix, id),
        }
    }

    /// Resolved name of a bare table, e.g. `posts` -> `wp_7_posts`.
    pub fn table(&self, bare: &str) -> Option<&str> {
        self.resolved.get(bare).map(String::as_str)
    }

    /// Lists `(bare, name)` pairs for `scope`. With `with_prefix` unset the
    /// name is the bare name. `blog_id` selects another tenant's prefix.
    pub fn tables(&self, scope: TableScope, with_prefix: bool, blog_id: Option<u64>) -> Vec<(String, String)> {
        let sets = &self.sets;
        let mut bare: Vec<&String> = match scope {
            TableScope::All => sets.global.iter().chain(&sets.blog).collect(),
            TableScope::Blog => sets.blog.iter().collect(),
            TableScope::Global => sets.global.iter().collect(),
            TableScope::MsGlobal => sets.ms_global.iter().collect(),
            TableScope::Old => sets.old.iter().collect(),
        };
        if self.multisite {
            match scope {
                TableScope::All | TableScope::Global => bare.extend(&sets.ms_global),
                TableScope::Old => bare.extend(&sets.old_ms_global),
                _ => {}
            }
        }

        if !with_prefix {
            return bare.into_iter().map(|t| (t.clone(), t.clone())).collect();
        }

        let blog_prefix = self.blog_prefix(blog_id.filter(|&id| id != 0));
        bare.into_iter()
            .map(|table| {
                let name = match table.as_str() {
                    "users" if self.custom_user_table.is_some() => {
                        self.custom_user_table.clone().unwrap_or_default()
                    }
                    "usermeta" if self.custom_user_meta_table.is_some() => {
                        self.custom_user_meta_table.clone().unwrap_or_default()
                    }
                    _ if self.is_global(table) => format!("{}{}", self.base_prefix, table),
                    _ => format!("{}{}", blog_prefix, table),
                };
                (table.clone(), name)
            })
            .collect()
    }

    fn is_global(&self, table: &str) -> bool {
        self.sets.global.iter().chain(&self.sets.ms_global).any(|t| t == table)
    }

    fn refresh_global(&mut self) {
        let tables = self.tables(TableScope::Global, true, None);
        self.resolved.extend(tables);
    }

    fn refresh_blog(&mut self) {
        self.prefix = self.blog_prefix(None);
        let mut tables = self.tables(TableScope::Blog, true, None);
        tables.extend(self.tables(TableScope::Old, true, None));
        self.resolved.extend(tables);
    }
}
