//! Repeat-group flattening
//!
//! A form's field tree may hold repeat groups, which may hold further repeat
//! groups. Each group becomes its own flat record stream whose rows carry
//! the key of the row they belong to ([`ParentLink`]).
//!
//! Groups are processed in discovery order (pre-order), so a group's parent
//! rows are always known before the group itself is linked.

use formsync_common::RawRecord;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::warn;

use crate::fetch::InferredColumn;
use crate::registry::{FieldSpec, CHILD_KEY_COLUMN, PARENT_KEY_COLUMN};

/// Correlation column carrying the parent row's key in repeat-group exports
pub const PARENT_KEY_SOURCE: &str = "PARENT_KEY";

/// Correlation column carrying a repeat-group row's own key
pub const KEY_SOURCE: &str = "KEY";

/// A repeat group found while walking a field tree
#[derive(Debug, Clone, PartialEq)]
pub struct RepeatGroup {
    /// Source names from the top-level field down to this group
    pub path: Vec<String>,
    /// Target names along the same path; names the group's table
    pub target_path: Vec<String>,
    /// Index of the enclosing group in the discovery list
    pub enclosing: Option<usize>,
    pub spec: FieldSpec,
    /// False for groups reported by the source but absent from configuration
    pub declared: bool,
}

impl RepeatGroup {
    /// Source name of the group itself
    pub fn name(&self) -> &str {
        &self.spec.source_name
    }

    pub fn path_display(&self) -> String {
        self.path.join("/")
    }
}

/// List every repeat group in pre-order: a group before any group nested in it
pub fn discover_repeat_groups(fields: &[FieldSpec]) -> Vec<RepeatGroup> {
    let mut groups = Vec::new();
    walk(fields, None, &[], &[], None, true, &mut groups);
    groups
}

/// Like [`discover_repeat_groups`], but also lists groups present in the
/// source's own field tree that configuration does not declare.
///
/// Declared groups come first at each level, in declaration order.
pub fn discover_with_remote(declared: &[FieldSpec], remote: &[FieldSpec]) -> Vec<RepeatGroup> {
    let mut groups = Vec::new();
    walk(declared, Some(remote), &[], &[], None, true, &mut groups);
    groups
}

fn walk(
    fields: &[FieldSpec],
    remote: Option<&[FieldSpec]>,
    path: &[String],
    target_path: &[String],
    enclosing: Option<usize>,
    declared: bool,
    out: &mut Vec<RepeatGroup>,
) {
    let remote_repeats: HashMap<&str, &FieldSpec> = remote
        .unwrap_or_default()
        .iter()
        .filter(|f| f.is_repeat())
        .map(|f| (f.source_name.as_str(), f))
        .collect();

    for field in fields.iter().filter(|f| f.is_repeat()) {
        let remote_children = remote_repeats.get(field.source_name.as_str()).map(|f| f.children());
        visit(field, remote_children, path, target_path, enclosing, declared, out);
    }

    if let Some(remote) = remote {
        let known: HashSet<&str> = fields.iter().map(|f| f.source_name.as_str()).collect();
        for field in remote
            .iter()
            .filter(|f| f.is_repeat() && !known.contains(f.source_name.as_str()))
        {
            visit(field, None, path, target_path, enclosing, false, out);
        }
    }
}

fn visit(
    field: &FieldSpec,
    remote_children: Option<&[FieldSpec]>,
    path: &[String],
    target_path: &[String],
    enclosing: Option<usize>,
    declared: bool,
    out: &mut Vec<RepeatGroup>,
) {
    let mut path = path.to_vec();
    path.push(field.source_name.clone());
    let mut target_path = target_path.to_vec();
    target_path.push(field.target_name.clone());

    let index = out.len();
    out.push(RepeatGroup {
        path: path.clone(),
        target_path: target_path.clone(),
        enclosing,
        spec: field.clone(),
        declared,
    });

    walk(
        field.children(),
        remote_children,
        &path,
        &target_path,
        Some(index),
        declared,
        out,
    );
}

/// Child schema for an undeclared group, taken from its export's header.
///
/// Correlation and `SET-OF-*` columns are left out; nested repeat groups
/// reported by the source are kept.
pub fn inferred_group_spec(group: &RepeatGroup, columns: &[InferredColumn]) -> FieldSpec {
    let reserved = [
        PARENT_KEY_SOURCE,
        KEY_SOURCE,
        CHILD_KEY_COLUMN,
        PARENT_KEY_COLUMN,
    ];

    let mut children: Vec<FieldSpec> = columns
        .iter()
        .filter(|c| !reserved.iter().any(|r| r.eq_ignore_ascii_case(&c.name)))
        .filter(|c| !c.name.starts_with("SET-OF-"))
        .map(|c| FieldSpec::scalar(&c.name, c.data_type))
        .collect();
    children.extend(group.spec.children().iter().filter(|f| f.is_repeat()).cloned());

    FieldSpec::repeat(&group.spec.source_name, children).with_target(&group.spec.target_name)
}

/// A repeat-group row tied to the row it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    pub parent_key: String,
    /// The row's own key; parent of any group nested inside it
    pub key: String,
    pub record: RawRecord,
}

/// A row that repeat-group rows can attach to
#[derive(Debug, Clone, Copy)]
pub struct ParentRow<'a> {
    pub key: &'a str,
    pub record: &'a RawRecord,
}

/// Where a group's rows come from
#[derive(Debug)]
pub enum GroupSource {
    /// Rows exported on their own, correlated through `PARENT_KEY`
    Separate(Vec<RawRecord>),
    /// Rows nested as arrays inside each parent row
    Embedded,
}

#[derive(Debug, Default)]
pub struct Expansion {
    pub links: Vec<ParentLink>,
    /// Rows whose parent is not among the parent rows
    pub orphans: usize,
    /// Embedded entries that are not objects
    pub malformed: usize,
}

/// Flatten one repeat group against the rows of its parent level
pub fn expand(group: &RepeatGroup, source: GroupSource, parents: &[ParentRow<'_>]) -> Expansion {
    let expansion = match source {
        GroupSource::Separate(rows) => link_separate(group, rows, parents),
        GroupSource::Embedded => expand_embedded(group, parents),
    };

    if expansion.orphans > 0 || expansion.malformed > 0 {
        warn!(
            group = %group.path_display(),
            orphans = expansion.orphans,
            malformed = expansion.malformed,
            "Dropped repeat-group rows that cannot be linked to a parent"
        );
    }
    expansion
}

fn link_separate(group: &RepeatGroup, rows: Vec<RawRecord>, parents: &[ParentRow<'_>]) -> Expansion {
    let parent_keys: HashSet<&str> = parents.iter().map(|p| p.key).collect();
    let mut ordinals: HashMap<String, usize> = HashMap::new();
    let mut expansion = Expansion::default();

    for record in rows {
        let Some(parent_key) = text_value(record.get(PARENT_KEY_SOURCE)) else {
            expansion.orphans += 1;
            continue;
        };
        if !parent_keys.contains(parent_key.as_str()) {
            expansion.orphans += 1;
            continue;
        }

        let ordinal = ordinals.entry(parent_key.clone()).or_insert(0);
        *ordinal += 1;
        let key = text_value(record.get(KEY_SOURCE))
            .unwrap_or_else(|| synthetic_key(&parent_key, group.name(), *ordinal));

        expansion.links.push(ParentLink {
            parent_key,
            key,
            record,
        });
    }

    expansion
}

fn expand_embedded(group: &RepeatGroup, parents: &[ParentRow<'_>]) -> Expansion {
    let mut expansion = Expansion::default();

    for parent in parents {
        let Some(Value::Array(entries)) = parent.record.get(group.name()) else {
            continue;
        };

        for (position, entry) in entries.iter().enumerate() {
            let Value::Object(child) = entry else {
                expansion.malformed += 1;
                continue;
            };

            let mut record = child.clone();
            let key = synthetic_key(parent.key, group.name(), position + 1);
            record.insert(PARENT_KEY_SOURCE.to_string(), Value::String(parent.key.to_string()));
            record.insert(KEY_SOURCE.to_string(), Value::String(key.clone()));

            expansion.links.push(ParentLink {
                parent_key: parent.key.to_string(),
                key,
                record,
            });
        }
    }

    expansion
}

/// `{parent}/{group}[{n}]` with a 1-based position, as SurveyCTO keys repeats
pub fn synthetic_key(parent_key: &str, group: &str, ordinal: usize) -> String {
    format!("{}/{}[{}]", parent_key, group, ordinal)
}

fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use formsync_common::ScalarType;
    use serde_json::json;

    fn raw(value: Value) -> RawRecord {
        value.as_object().unwrap().clone()
    }

    fn household_tree() -> Vec<FieldSpec> {
        vec![
            FieldSpec::scalar("KEY", ScalarType::String),
            FieldSpec::repeat(
                "household_members",
                vec![
                    FieldSpec::scalar("name", ScalarType::String),
                    FieldSpec::repeat("visits", vec![FieldSpec::scalar("visit_date", ScalarType::Date)]),
                ],
            )
            .with_target("members"),
            FieldSpec::repeat("plots", vec![FieldSpec::scalar("area", ScalarType::Float)]),
        ]
    }

    #[test]
    fn test_discovery_is_pre_order() {
        let groups = discover_repeat_groups(&household_tree());
        let paths: Vec<String> = groups.iter().map(RepeatGroup::path_display).collect();

        assert_eq!(paths, vec!["household_members", "household_members/visits", "plots"]);
        assert_eq!(groups[0].enclosing, None);
        assert_eq!(groups[1].enclosing, Some(0));
        assert_eq!(groups[1].target_path, vec!["members", "visits"]);
        assert_eq!(groups[2].enclosing, None);
        assert!(groups.iter().all(|g| g.declared));
    }

    #[test]
    fn test_discovery_without_repeats() {
        let fields = vec![FieldSpec::scalar("q1", ScalarType::String)];
        assert!(discover_repeat_groups(&fields).is_empty());
    }

    #[test]
    fn test_discover_with_remote_adds_undeclared() {
        let remote = vec![
            FieldSpec::repeat(
                "household_members",
                vec![
                    FieldSpec::scalar("name", ScalarType::String),
                    FieldSpec::repeat("vaccinations", vec![FieldSpec::scalar("dose", ScalarType::Int)]),
                ],
            ),
            FieldSpec::repeat("livestock", vec![FieldSpec::scalar("kind", ScalarType::String)]),
        ];

        let groups = discover_with_remote(&household_tree(), &remote);
        let listed: Vec<(String, bool)> = groups.iter().map(|g| (g.path_display(), g.declared)).collect();

        assert_eq!(
            listed,
            vec![
                ("household_members".to_string(), true),
                ("household_members/visits".to_string(), true),
                ("household_members/vaccinations".to_string(), false),
                ("plots".to_string(), true),
                ("livestock".to_string(), false),
            ]
        );
        assert_eq!(groups[2].enclosing, Some(0));
    }

    #[test]
    fn test_inferred_group_spec() {
        let groups = discover_repeat_groups(&[FieldSpec::repeat(
            "livestock",
            vec![FieldSpec::repeat("treatments", vec![FieldSpec::scalar("drug", ScalarType::String)])],
        )]);
        let group = &groups[0];
        let columns = vec![
            InferredColumn { name: "kind".to_string(), data_type: ScalarType::String },
            InferredColumn { name: "count".to_string(), data_type: ScalarType::Int },
            InferredColumn { name: "PARENT_KEY".to_string(), data_type: ScalarType::String },
            InferredColumn { name: "KEY".to_string(), data_type: ScalarType::String },
            InferredColumn { name: "SET-OF-treatments".to_string(), data_type: ScalarType::String },
        ];

        let spec = inferred_group_spec(group, &columns);
        let names: Vec<&str> = spec.children().iter().map(|f| f.source_name.as_str()).collect();
        assert_eq!(names, vec!["kind", "count", "treatments"]);
        assert_eq!(spec.children()[1], FieldSpec::scalar("count", ScalarType::Int));
    }

    #[test]
    fn test_separate_links_by_parent_key() {
        let groups = discover_repeat_groups(&household_tree());
        let parent = raw(json!({ "KEY": "7" }));
        let parents = [ParentRow { key: "7", record: &parent }];

        let rows = vec![raw(json!({ "PARENT_KEY": "7", "name": "Amina" }))];
        let expansion = expand(&groups[0], GroupSource::Separate(rows), &parents);

        assert_eq!(expansion.links.len(), 1);
        assert_eq!(expansion.links[0].parent_key, "7");
        assert_eq!(expansion.links[0].key, "7/household_members[1]");
        assert_eq!(expansion.links[0].record["name"], json!("Amina"));
        assert_eq!(expansion.orphans, 0);
    }

    #[test]
    fn test_separate_drops_orphans() {
        let groups = discover_repeat_groups(&household_tree());
        let parent = raw(json!({ "KEY": "uuid:1" }));
        let parents = [ParentRow { key: "uuid:1", record: &parent }];

        let rows = vec![
            raw(json!({ "PARENT_KEY": "uuid:1", "KEY": "uuid:1/household_members[1]" })),
            raw(json!({ "PARENT_KEY": "uuid:9", "KEY": "uuid:9/household_members[1]" })),
            raw(json!({ "KEY": "stray" })),
        ];
        let expansion = expand(&groups[0], GroupSource::Separate(rows), &parents);

        assert_eq!(expansion.links.len(), 1);
        assert_eq!(expansion.links[0].key, "uuid:1/household_members[1]");
        assert_eq!(expansion.orphans, 2);
    }

    #[test]
    fn test_embedded_synthesizes_keys() {
        let groups = discover_repeat_groups(&household_tree());
        let first = raw(json!({
            "_id": 1,
            "household_members": [ { "name": "Amina" }, { "name": "Juma" }, "garbage" ]
        }));
        let second = raw(json!({ "_id": 2 }));
        let parents = [
            ParentRow { key: "1", record: &first },
            ParentRow { key: "2", record: &second },
        ];

        let expansion = expand(&groups[0], GroupSource::Embedded, &parents);

        let keys: Vec<&str> = expansion.links.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(keys, vec!["1/household_members[1]", "1/household_members[2]"]);
        assert_eq!(expansion.links[1].record["PARENT_KEY"], json!("1"));
        assert_eq!(expansion.links[1].record["KEY"], json!("1/household_members[2]"));
        assert_eq!(expansion.malformed, 1);
    }

    #[test]
    fn test_embedded_nested_groups() {
        let groups = discover_repeat_groups(&household_tree());
        let submission = raw(json!({
            "household_members": [
                { "name": "Amina", "visits": [ { "visit_date": "2024-01-02" } ] }
            ]
        }));
        let top = expand(
            &groups[0],
            GroupSource::Embedded,
            &[ParentRow { key: "1", record: &submission }],
        );

        let member_rows: Vec<ParentRow<'_>> = top
            .links
            .iter()
            .map(|l| ParentRow { key: &l.key, record: &l.record })
            .collect();
        let nested = expand(&groups[1], GroupSource::Embedded, &member_rows);

        assert_eq!(nested.links.len(), 1);
        assert_eq!(nested.links[0].parent_key, "1/household_members[1]");
        assert_eq!(nested.links[0].key, "1/household_members[1]/visits[1]");
    }

    #[test]
    fn test_every_link_matches_one_parent() {
        let groups = discover_repeat_groups(&household_tree());
        let parent_a = raw(json!({}));
        let parent_b = raw(json!({}));
        let parents = [
            ParentRow { key: "a", record: &parent_a },
            ParentRow { key: "b", record: &parent_b },
        ];
        let rows = ["a", "b", "c", "a", ""]
            .iter()
            .map(|k| raw(json!({ "PARENT_KEY": k })))
            .collect();

        let expansion = expand(&groups[0], GroupSource::Separate(rows), &parents);
        for link in &expansion.links {
            assert_eq!(parents.iter().filter(|p| p.key == link.parent_key).count(), 1);
        }
        assert_eq!(expansion.links.len(), 3);
        assert_eq!(expansion.orphans, 2);
        assert_eq!(expansion.links[2].key, "a/household_members[2]");
    }
}
