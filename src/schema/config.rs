//! On-disk shape of schema node configs

use serde::Deserialize;
use std::collections::BTreeMap;

/// One `.yml` schema node as written by schema authors
///
/// Every field is optional: the loader fills in the kind and name from
/// where the config was found (a `children` entry, a template directory
/// entry, or an `include`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Node kind: `directory`, `entity`, `file` or `include`
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Entity type bound by an `entity` node
    pub entity_type: Option<String>,

    /// Literal name
    pub name: Option<String>,

    /// Expression computing the name
    pub name_expr: Option<String>,

    /// Template rendered against the entity fields
    pub name_format: Option<String>,

    /// Existence condition; the subtree is skipped when false
    pub condition: Option<String>,

    /// Template directory or file, relative to the schema root
    pub template: Option<String>,

    /// Schema file whose nodes an `include` node splices in
    pub include: Option<String>,

    /// Child schemas keyed by context entity type
    pub children: BTreeMap<String, ChildRef>,

    /// Static child nodes
    pub contents: Vec<ChildRef>,
}

/// A child declaration: a schema file path or an inline config
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChildRef {
    File(String),
    Inline(Box<NodeConfig>),
}

impl NodeConfig {
    /// Apply a `.yml` overlay on top of a generated config
    ///
    /// Scalar settings in the overlay win; child declarations accumulate.
    pub fn overlay(&mut self, other: NodeConfig) {
        let other_named = other.name.is_some();
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(kind, entity_type, name, name_expr, name_format, condition, template, include);

        // An explicit naming choice replaces the generated literal name
        if self.name_expr.is_some() || self.name_format.is_some() {
            if !other_named {
                self.name = None;
            }
        }
        self.children.extend(other.children);
        self.contents.extend(other.contents);
    }
}
