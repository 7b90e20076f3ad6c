//! Per-post-type field configuration.
//!
//! Loaded once at startup (YAML file or built-in default) and validated:
//! a field can only be sortable when it holds a single scalar value.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    #[default]
    Scalar,
    Array,
    Taxonomy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

fn default_weight() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConfig {
    #[serde(default)]
    pub indexable: bool,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub filterable: bool,
    #[serde(default)]
    pub sortable: bool,
    #[serde(default)]
    pub sort_direction: SortDirection,
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldConfig {
    fn indexed(weight: f32) -> Self {
        Self {
            indexable: true,
            weight,
            filterable: false,
            sortable: false,
            sort_direction: SortDirection::Desc,
            kind: FieldKind::Scalar,
        }
    }

    fn filterable(mut self) -> Self {
        self.filterable = true;
        self
    }

    fn sortable(mut self, direction: SortDirection) -> Self {
        self.sortable = true;
        self.sort_direction = direction;
        self
    }

    fn kind(mut self, kind: FieldKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostTypeSchema {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    pub fields: BTreeMap<String, FieldConfig>,
}

impl PostTypeSchema {
    /// Searchable fields and their weights.
    pub fn indexable_fields(&self) -> Vec<(String, f32)> {
        self.fields
            .iter()
            .filter(|(_, f)| f.indexable)
            .map(|(name, f)| (name.clone(), f.weight))
            .collect()
    }

    pub fn filterable_fields(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|(_, f)| f.filterable)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn sortable_fields(&self) -> Vec<(String, SortDirection)> {
        self.fields
            .iter()
            .filter(|(_, f)| f.sortable)
            .map(|(name, f)| (name.clone(), f.sort_direction))
            .collect()
    }
}

/// Final say on whether a field may be sorted on.
///
/// Called only for fields that already passed the hard rules (scalar,
/// not taxonomy, not blacklisted). `heuristic` is the verdict of the
/// naming-convention check.
pub trait SortablePolicy: Send + Sync {
    fn allow(&self, post_type: &str, field: &str, heuristic: bool) -> bool;
}

/// Accepts the naming-convention verdict unchanged.
pub struct DefaultSortablePolicy;

impl SortablePolicy for DefaultSortablePolicy {
    fn allow(&self, _post_type: &str, _field: &str, heuristic: bool) -> bool {
        heuristic
    }
}

/// Fields that never hold a single scalar.
const NON_SCALAR_BLACKLIST: &[&str] = &[
    "post_content",
    "post_content_filtered",
    "post_excerpt",
    "post_password",
    "guid",
    "content",
    "excerpt",
    "tags",
    "categories",
    "gallery",
    "attachments",
];

/// Core fields known to be scalar. Always sortable; neither the naming
/// heuristic nor a policy is consulted for them.
const SORTABLE_SAFELIST: &[&str] = &[
    "id",
    "post_title",
    "post_date",
    "post_modified",
    "post_author",
    "post_name",
    "menu_order",
    "comment_count",
];

/// Name segments that suggest a list-valued meta field.
static ARRAY_NAME_HINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(^|_)(ids|list|items|images|gallery|repeater|rows|json|array|set)($|_)")
        .expect("valid regex")
});

/// Whether `field` of the given kind may be sorted on, before any policy
/// override. Blacklisted, taxonomy and array fields are never sortable.
pub fn hard_rules_allow(field: &str, kind: FieldKind) -> bool {
    if kind != FieldKind::Scalar {
        return false;
    }
    if field.starts_with("taxonomy_") {
        return false;
    }
    !NON_SCALAR_BLACKLIST.contains(&field)
}

/// Naming-convention check for fields that passed the hard rules.
pub fn name_looks_scalar(field: &str) -> bool {
    !ARRAY_NAME_HINT.is_match(field)
}

pub fn is_sortable_safe(post_type: &str, field: &str, kind: FieldKind, policy: &dyn SortablePolicy) -> bool {
    if !hard_rules_allow(field, kind) {
        return false;
    }
    SORTABLE_SAFELIST.contains(&field) || policy.allow(post_type, field, name_looks_scalar(field))
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    post_types: Vec<PostTypeSchema>,
}

/// All configured post types, in configuration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    post_types: Vec<PostTypeSchema>,
}

impl Schema {
    /// Validate and build. Unsafe `sortable` flags are cleared with a warning.
    pub fn new(post_types: Vec<PostTypeSchema>, policy: &dyn SortablePolicy) -> anyhow::Result<Self> {
        if post_types.is_empty() {
            anyhow::bail!("schema defines no post types");
        }

        let mut seen = std::collections::HashSet::new();
        let mut validated = Vec::with_capacity(post_types.len());
        for mut pt in post_types {
            if pt.name.trim().is_empty() {
                anyhow::bail!("post type with empty name");
            }
            if !seen.insert(pt.name.clone()) {
                anyhow::bail!("post type '{}' is defined twice", pt.name);
            }
            if !pt.fields.values().any(|f| f.indexable) {
                anyhow::bail!("post type '{}' has no indexable fields", pt.name);
            }

            for (field, cfg) in pt.fields.iter_mut() {
                if !cfg.weight.is_finite() || cfg.weight <= 0.0 {
                    anyhow::bail!("field '{}.{}' needs a positive weight", pt.name, field);
                }
                if cfg.sortable && !is_sortable_safe(&pt.name, field, cfg.kind, policy) {
                    tracing::warn!(
                        post_type = %pt.name,
                        field = %field,
                        "field is not scalar-safe; sorting disabled"
                    );
                    cfg.sortable = false;
                }
            }
            validated.push(pt);
        }

        Ok(Self { post_types: validated })
    }

    pub fn from_yaml(yaml: &str, policy: &dyn SortablePolicy) -> anyhow::Result<Self> {
        let file: SchemaFile = serde_yaml::from_str(yaml).context("invalid schema YAML")?;
        Self::new(file.post_types, policy)
    }

    pub fn from_file(path: &Path, policy: &dyn SortablePolicy) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read schema file {}", path.display()))?;
        Self::from_yaml(&yaml, policy)
    }

    /// Built-in schema for `post` and `page`.
    pub fn default_schema() -> Self {
        let post = PostTypeSchema {
            name: "post".into(),
            label: Some("Posts".into()),
            fields: BTreeMap::from([
                ("post_title".into(), FieldConfig::indexed(2.0).sortable(SortDirection::Asc)),
                ("post_content".into(), FieldConfig::indexed(1.0)),
                ("post_excerpt".into(), FieldConfig::indexed(1.5)),
                (
                    "post_date".into(),
                    FieldConfig { indexable: false, ..FieldConfig::indexed(1.0) }
                        .filterable()
                        .sortable(SortDirection::Desc),
                ),
                (
                    "post_author".into(),
                    FieldConfig { indexable: false, ..FieldConfig::indexed(1.0) }.filterable(),
                ),
                (
                    "taxonomy_category".into(),
                    FieldConfig::indexed(1.0).filterable().kind(FieldKind::Taxonomy),
                ),
                (
                    "taxonomy_post_tag".into(),
                    FieldConfig::indexed(1.0).filterable().kind(FieldKind::Taxonomy),
                ),
            ]),
        };
        let page = PostTypeSchema {
            name: "page".into(),
            label: Some("Pages".into()),
            fields: BTreeMap::from([
                ("post_title".into(), FieldConfig::indexed(2.0).sortable(SortDirection::Asc)),
                ("post_content".into(), FieldConfig::indexed(1.0)),
                (
                    "post_date".into(),
                    FieldConfig { indexable: false, ..FieldConfig::indexed(1.0) }
                        .filterable()
                        .sortable(SortDirection::Desc),
                ),
            ]),
        };
        Self {
            post_types: vec![post, page],
        }
    }

    pub fn get(&self, post_type: &str) -> Option<&PostTypeSchema> {
        self.post_types.iter().find(|p| p.name == post_type)
    }

    pub fn contains(&self, post_type: &str) -> bool {
        self.get(post_type).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.post_types.iter().map(|p| p.name.clone()).collect()
    }

    pub fn post_types(&self) -> &[PostTypeSchema] {
        &self.post_types
    }
}
