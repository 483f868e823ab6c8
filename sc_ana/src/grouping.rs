//! Group-by expressions that restrict batch correction to comparable cells.
//!
//! Three forms are recognised, selected by their separator characters:
//!
//! * `attr` - one group per distinct value of a cell attribute
//! * `attr1+attr2+...` - one group per distinct tuple of attribute values
//! * `attr=v1,v2;v3;...` - group `i` holds the cells whose `attr` value is in
//!   the `i`-th list, group 0 holds the rest
//!
//! An empty expression puts every cell into group 0.

use itertools::Itertools;
use sc_types::MetadataTable;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupingError {
    #[error("attribute '{0}' does not exist in the cell metadata")]
    UnknownAttribute(String),

    #[error("malformed grouping clause '{clause}': {reason}")]
    MalformedClause { clause: String, reason: String },

    #[error("value '{value}' of attribute '{attr}' appears in value lists {first} and {second}")]
    OverlappingValue {
        attr: String,
        value: String,
        first: usize,
        second: usize,
    },
}

fn malformed(clause: &str, reason: &str) -> GroupingError {
    GroupingError::MalformedClause {
        clause: clause.to_string(),
        reason: reason.to_string(),
    }
}

const SEPARATORS: &[char] = &['+', '=', ';', ','];

fn attribute_name(raw: &str, clause: &str) -> Result<String, GroupingError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(malformed(clause, "empty attribute name"));
    }
    if name.contains(SEPARATORS) {
        return Err(malformed(
            clause,
            &format!("'{name}' is not a valid attribute name"),
        ));
    }
    Ok(name.to_string())
}

/// A syntactically valid grouping expression, not yet bound to a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupingExpr {
    /// All cells in a single group.
    All,
    /// Group by the distinct values of one attribute.
    Attribute(String),
    /// Group by the Cartesian product of several attributes.
    Product(Vec<String>),
    /// Explicit, pairwise disjoint value lists of one attribute.
    ValueLists { attr: String, lists: Vec<Vec<String>> },
}

impl FromStr for GroupingExpr {
    type Err = GroupingError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(GroupingExpr::All);
        }
        if expr.contains('=') || expr.contains(';') {
            return parse_value_lists(expr);
        }
        if expr.contains(',') {
            return Err(malformed(expr, "',' is only allowed inside 'attr=...' value lists"));
        }
        if expr.contains('+') {
            let attrs = expr
                .split('+')
                .map(|a| attribute_name(a, expr))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(GroupingExpr::Product(attrs));
        }
        Ok(GroupingExpr::Attribute(attribute_name(expr, expr)?))
    }
}

fn parse_value_lists(expr: &str) -> Result<GroupingExpr, GroupingError> {
    let Some((attr, rhs)) = expr.split_once('=') else {
        return Err(malformed(expr, "';' is only allowed after 'attr='"));
    };
    if rhs.contains('=') {
        return Err(malformed(expr, "more than one '='"));
    }
    let attr = attribute_name(attr, expr)?;

    let mut owner: HashMap<String, usize> = HashMap::new();
    let mut lists = Vec::new();
    for (i, list) in rhs.split(';').enumerate() {
        let group = i + 1;
        let mut values = Vec::new();
        for value in list.split(',') {
            let value = value.trim();
            if value.is_empty() {
                return Err(malformed(expr, &format!("empty value in list {group}")));
            }
            match owner.get(value) {
                Some(&first) if first != group => {
                    return Err(GroupingError::OverlappingValue {
                        attr,
                        value: value.to_string(),
                        first,
                        second: group,
                    });
                }
                Some(_) => {}
                None => {
                    owner.insert(value.to_string(), group);
                    values.push(value.to_string());
                }
            }
        }
        lists.push(values);
    }
    Ok(GroupingExpr::ValueLists { attr, lists })
}

impl fmt::Display for GroupingExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupingExpr::All => Ok(()),
            GroupingExpr::Attribute(a) => f.write_str(a),
            GroupingExpr::Product(attrs) => write!(f, "{}", attrs.join("+")),
            GroupingExpr::ValueLists { attr, lists } => write!(
                f,
                "{attr}={}",
                lists.iter().map(|l| l.join(",")).join(";")
            ),
        }
    }
}

impl GroupingExpr {
    /// Parse an optional expression; `None` means a single group.
    pub fn parse(expr: Option<&str>) -> Result<Self, GroupingError> {
        expr.map_or(Ok(GroupingExpr::All), str::parse)
    }

    /// Attributes the expression refers to.
    pub fn attributes(&self) -> Vec<&str> {
        match self {
            GroupingExpr::All => Vec::new(),
            GroupingExpr::Attribute(a) => vec![a.as_str()],
            GroupingExpr::Product(attrs) => attrs.iter().map(String::as_str).collect(),
            GroupingExpr::ValueLists { attr, .. } => vec![attr.as_str()],
        }
    }

    /// Fail on the first referenced attribute for which `present` is false.
    pub fn check_attributes(&self, present: impl Fn(&str) -> bool) -> Result<(), GroupingError> {
        match self.attributes().into_iter().find(|a| !present(a)) {
            Some(missing) => Err(GroupingError::UnknownAttribute(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Assign every cell of `obs` to a group.
    pub fn resolve(&self, obs: &MetadataTable) -> Result<GroupAssignment, GroupingError> {
        self.check_attributes(|a| obs.contains(a))?;
        let n = obs.n_rows();
        let column = |a: &str| {
            obs.get(a)
                .ok_or_else(|| GroupingError::UnknownAttribute(a.to_string()))
        };

        match self {
            GroupingExpr::All => Ok(GroupAssignment {
                groups: vec![0; n],
                labels: vec!["all".to_string()],
            }),
            GroupingExpr::Attribute(a) => {
                let col = column(a)?;
                Ok(GroupAssignment::by_first_appearance(
                    (0..n).map(|i| col.value_str(i).into_owned()),
                    String::clone,
                ))
            }
            GroupingExpr::Product(attrs) => {
                let cols = attrs
                    .iter()
                    .map(|a| column(a))
                    .collect::<Result<Vec<_>, _>>()?;
                // keyed on the value tuple, values may themselves contain '+'
                Ok(GroupAssignment::by_first_appearance(
                    (0..n).map(|i| {
                        cols.iter()
                            .map(|c| c.value_str(i).into_owned())
                            .collect::<Vec<_>>()
                    }),
                    |values| values.join("+"),
                ))
            }
            GroupingExpr::ValueLists { attr, lists } => {
                let col = column(attr)?;
                let owner: HashMap<&str, usize> = lists
                    .iter()
                    .enumerate()
                    .flat_map(|(i, l)| l.iter().map(move |v| (v.as_str(), i + 1)))
                    .collect();
                let groups = (0..n)
                    .map(|i| owner.get(col.value_str(i).as_ref()).copied().unwrap_or(0))
                    .collect();
                let labels = std::iter::once("unmatched".to_string())
                    .chain(lists.iter().map(|l| format!("{attr}={}", l.join(","))))
                    .collect();
                Ok(GroupAssignment { groups, labels })
            }
        }
    }
}

/// Group id for every cell, plus a printable label per group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupAssignment {
    groups: Vec<usize>,
    labels: Vec<String>,
}

impl GroupAssignment {
    fn by_first_appearance<K: Eq + Hash>(
        keys: impl Iterator<Item = K>,
        label: impl Fn(&K) -> String,
    ) -> Self {
        let mut ids: HashMap<K, usize> = HashMap::new();
        let mut labels = Vec::new();
        let groups = keys
            .map(|key| {
                let next = ids.len();
                *ids.entry(key).or_insert_with_key(|key| {
                    labels.push(label(key));
                    next
                })
            })
            .collect();
        GroupAssignment { groups, labels }
    }

    /// Group id of every cell.
    pub fn groups(&self) -> &[usize] {
        &self.groups
    }

    /// Number of group ids, including an empty unmatched group.
    pub fn n_groups(&self) -> usize {
        self.labels.len()
    }

    pub fn label(&self, group: usize) -> &str {
        &self.labels[group]
    }

    /// Cells of each group, in cell order.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members = vec![Vec::new(); self.n_groups()];
        for (cell, &g) in self.groups.iter().enumerate() {
            members[g].push(cell);
        }
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sc_types::Column;

    fn obs(cols: &[(&str, Vec<&str>)]) -> MetadataTable {
        let mut table = MetadataTable::new(cols[0].1.len());
        for (name, values) in cols {
            table
                .insert(
                    *name,
                    Column::Str(values.iter().map(ToString::to_string).collect()),
                )
                .unwrap();
        }
        table
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(GroupingExpr::parse(None).unwrap(), GroupingExpr::All);
        assert_eq!("  ".parse::<GroupingExpr>().unwrap(), GroupingExpr::All);
        assert_eq!(
            "Individual".parse::<GroupingExpr>().unwrap(),
            GroupingExpr::Attribute("Individual".into())
        );
        assert_eq!(
            "Individual + Assay".parse::<GroupingExpr>().unwrap(),
            GroupingExpr::Product(vec!["Individual".into(), "Assay".into()])
        );
        assert_eq!(
            "Channel=1,2;3".parse::<GroupingExpr>().unwrap(),
            GroupingExpr::ValueLists {
                attr: "Channel".into(),
                lists: vec![vec!["1".into(), "2".into()], vec!["3".into()]],
            }
        );
    }

    #[test]
    fn test_malformed_clauses() {
        for bad in ["a++b", "a+", "attr=x,,y", "attr=", "=x", "a=b=c", "x;y", "a,b", "a+b=x"] {
            assert!(
                matches!(
                    bad.parse::<GroupingExpr>(),
                    Err(GroupingError::MalformedClause { .. })
                ),
                "{bad} should be malformed"
            );
        }
    }

    #[test]
    fn test_overlap_is_rejected() {
        let err = "Channel=a,b;c,a".parse::<GroupingExpr>().unwrap_err();
        assert_eq!(
            err,
            GroupingError::OverlappingValue {
                attr: "Channel".into(),
                value: "a".into(),
                first: 1,
                second: 2,
            }
        );
    }

    #[test]
    fn test_unknown_attribute() {
        let table = obs(&[("Channel", vec!["a", "b"])]);
        let expr: GroupingExpr = "Channel+Donor".parse().unwrap();
        assert_eq!(
            expr.resolve(&table).unwrap_err(),
            GroupingError::UnknownAttribute("Donor".into())
        );
    }

    #[test]
    fn test_product_groups() {
        let table = obs(&[
            ("donor", vec!["d1", "d1", "d2", "d2", "d1"]),
            ("assay", vec!["x", "y", "x", "x", "x"]),
        ]);
        let assignment = "donor+assay"
            .parse::<GroupingExpr>()
            .unwrap()
            .resolve(&table)
            .unwrap();
        assert_eq!(assignment.groups(), &[0, 1, 2, 2, 0]);
        assert_eq!(assignment.label(2), "d2+x");
        assert_eq!(assignment.members()[0], vec![0, 4]);
    }

    #[test]
    fn test_product_values_containing_plus_stay_apart() {
        let table = obs(&[("a", vec!["x+y", "x"]), ("b", vec!["z", "y+z"])]);
        let assignment = "a+b"
            .parse::<GroupingExpr>()
            .unwrap()
            .resolve(&table)
            .unwrap();
        assert_eq!(assignment.groups(), &[0, 1]);
        assert_eq!(assignment.n_groups(), 2);
        assert_eq!(assignment.label(0), "x+y+z");
        assert_eq!(assignment.label(1), "x+y+z");
    }

    #[test]
    fn test_value_lists_unmatched_is_zero() {
        let table = obs(&[("Channel", vec!["a", "b", "c", "d"])]);
        let assignment = "Channel=a;b,c"
            .parse::<GroupingExpr>()
            .unwrap()
            .resolve(&table)
            .unwrap();
        assert_eq!(assignment.groups(), &[1, 2, 2, 0]);
        assert_eq!(assignment.n_groups(), 3);
        assert_eq!(assignment.label(0), "unmatched");
    }

    fn string_table(values: &[u8]) -> MetadataTable {
        let mut table = MetadataTable::new(values.len());
        table
            .insert(
                "attr",
                Column::Str(values.iter().map(|v| format!("v{v}")).collect()),
            )
            .unwrap();
        table
    }

    proptest! {
        #[test]
        fn prop_single_attribute_matches_cardinality(values in prop::collection::vec(0u8..12, 1..300)) {
            let table = string_table(&values);
            let assignment = GroupingExpr::Attribute("attr".into()).resolve(&table).unwrap();
            let distinct: std::collections::HashSet<_> = assignment.groups().iter().collect();
            prop_assert_eq!(distinct.len(), table.get("attr").unwrap().cardinality());
            prop_assert_eq!(assignment.n_groups(), distinct.len());
        }

        #[test]
        fn prop_value_lists_cover_and_are_disjoint(
            values in prop::collection::vec(0u8..10, 1..300),
            owners in prop::collection::vec(0usize..4, 10),
        ) {
            // owners[v] == 0 leaves value v unlisted
            let lists: Vec<Vec<String>> = (1..4)
                .map(|g| (0..10u8).filter(|&v| owners[v as usize] == g).map(|v| format!("v{v}")).collect::<Vec<_>>())
                .filter(|l| !l.is_empty())
                .collect();
            prop_assume!(!lists.is_empty());
            let expr = format!(
                "attr={}",
                lists.iter().map(|l| l.join(",")).join(";")
            );
            let parsed: GroupingExpr = expr.parse().unwrap();
            let assignment = parsed.resolve(&string_table(&values)).unwrap();
            prop_assert_eq!(assignment.groups().len(), values.len());
            for (cell, &g) in assignment.groups().iter().enumerate() {
                let value = format!("v{}", values[cell]);
                let containing: Vec<usize> = lists
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| l.contains(&value))
                    .map(|(i, _)| i + 1)
                    .collect();
                prop_assert!(containing.len() <= 1);
                prop_assert_eq!(g, containing.first().copied().unwrap_or(0));
            }
        }

        #[test]
        fn prop_overlapping_lists_are_rejected(
            first in prop::collection::vec(0u8..8, 1..5),
            second in prop::collection::vec(0u8..8, 1..5),
            shared in 0u8..8,
        ) {
            let mut first = first;
            let mut second = second;
            first.push(shared);
            second.push(shared);
            let fmt_list = |l: &[u8]| l.iter().map(|v| format!("v{v}")).join(",");
            let expr = format!("attr={};{}", fmt_list(&first), fmt_list(&second));
            let is_overlap = matches!(
                expr.parse::<GroupingExpr>(),
                Err(GroupingError::OverlappingValue { .. })
            );
            prop_assert!(is_overlap);
        }
    }
}
