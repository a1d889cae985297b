//! Helpers for extracting values from KDL nodes.

use kdl::KdlNode;

pub(crate) fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

pub(crate) fn all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

pub(crate) fn first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

pub(crate) fn string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

/// Collect string values from every child node named `name`, accepting
/// multiple arguments per node (`deps "a" "b"`) as well as repeated nodes.
pub(crate) fn child_string_list(node: &KdlNode, name: &str) -> Vec<String> {
    let mut result = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == name {
                result.extend(all_string_args(child));
            }
        }
    }
    result
}

pub(crate) fn child_string(node: &KdlNode, name: &str) -> Option<String> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
        .and_then(first_string_arg)
}

pub(crate) fn child_int(node: &KdlNode, name: &str) -> Option<i128> {
    node.children()?
        .nodes()
        .iter()
        .find(|c| c.name().value() == name)
        .and_then(first_int_arg)
}
