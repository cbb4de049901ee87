//! Static entity hierarchy: which field of each type points at its parent

use std::collections::BTreeMap;

/// Field consulted for types missing from the table
const FALLBACK_PARENT_FIELD: &str = "project";

/// Maps an entity type to the field holding its parent
///
/// `None` marks a top-level type. Types not listed fall back to `project`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentFields {
    table: BTreeMap<String, Option<String>>,
}

impl Default for ParentFields {
    fn default() -> Self {
        let rows: [(&str, Option<&str>); 8] = [
            ("Project", None),
            ("Step", None),
            ("HumanUser", None),
            ("Sequence", Some("project")),
            ("Asset", Some("project")),
            ("Shot", Some("sequence")),
            ("Task", Some("entity")),
            ("Version", Some("entity")),
        ];
        Self {
            table: rows
                .into_iter()
                .map(|(t, f)| (t.to_string(), f.map(str::to_string)))
                .collect(),
        }
    }
}

impl ParentFields {
    /// Built-in table extended (or overridden) by configured rows
    pub fn with_overrides(overrides: &BTreeMap<String, Option<String>>) -> Self {
        let mut fields = Self::default();
        for (entity_type, field) in overrides {
            fields.table.insert(entity_type.clone(), field.clone());
        }
        fields
    }

    /// The parent field for a type, or `None` for top-level types
    pub fn field_for(&self, entity_type: &str) -> Option<&str> {
        match self.table.get(entity_type) {
            Some(field) => field.as_deref(),
            None => Some(FALLBACK_PARENT_FIELD),
        }
    }

    pub fn is_top_level(&self, entity_type: &str) -> bool {
        self.field_for(entity_type).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_rows() {
        let fields = ParentFields::default();
        assert_eq!(fields.field_for("Task"), Some("entity"));
        assert_eq!(fields.field_for("Shot"), Some("sequence"));
        assert_eq!(fields.field_for("Asset"), Some("project"));
        assert!(fields.is_top_level("Project"));
    }

    #[test]
    fn test_unknown_type_falls_back_to_project() {
        assert_eq!(ParentFields::default().field_for("CustomThing"), Some("project"));
    }

    #[test]
    fn test_overrides() {
        let mut overrides = BTreeMap::new();
        overrides.insert("Shot".to_string(), Some("scene".to_string()));
        overrides.insert("Department".to_string(), None);
        let fields = ParentFields::with_overrides(&overrides);
        assert_eq!(fields.field_for("Shot"), Some("scene"));
        assert!(fields.is_top_level("Department"));
        assert_eq!(fields.field_for("Task"), Some("entity"));
    }
}
