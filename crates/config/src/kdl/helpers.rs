//! Small accessors over KDL nodes.
//!
//! Settings are written as child nodes with a single argument
//! (`capacity 500`). Accessors return `Ok(None)` when the child is absent and
//! an error when it is present with the wrong type.

use anyhow::{anyhow, Result};
use kdl::{KdlNode, KdlValue};
use tracing::warn;

/// First positional argument of a node
pub fn first_arg(node: &KdlNode) -> Option<&KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// All positional string arguments of a node
pub fn string_args(node: &KdlNode) -> Result<Vec<String>> {
    node.entries()
        .iter()
        .filter(|entry| entry.name().is_none())
        .map(|entry| {
            entry.value().as_string().map(str::to_string).ok_or_else(|| {
                anyhow!(
                    "'{}' expects string arguments, got {}",
                    node.name().value(),
                    entry.value()
                )
            })
        })
        .collect()
}

fn child<'a>(node: &'a KdlNode, name: &str) -> Option<&'a KdlNode> {
    node.children()?.get(name)
}

fn required_arg<'a>(node: &'a KdlNode) -> Result<&'a KdlValue> {
    first_arg(node).ok_or_else(|| anyhow!("'{}' requires a value", node.name().value()))
}

/// String value of a node's argument
pub fn node_string(node: &KdlNode) -> Result<String> {
    let value = required_arg(node)?;
    value
        .as_string()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("'{}' must be a string, got {}", node.name().value(), value))
}

/// Non-negative integer value of a node's argument
pub fn node_u64(node: &KdlNode) -> Result<u64> {
    let value = required_arg(node)?;
    value
        .as_integer()
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| {
            anyhow!(
                "'{}' must be a non-negative integer, got {}",
                node.name().value(),
                value
            )
        })
}

/// Number value of a node's argument; integers are accepted
pub fn node_f64(node: &KdlNode) -> Result<f64> {
    let value = required_arg(node)?;
    value
        .as_float()
        .or_else(|| value.as_integer().map(|v| v as f64))
        .ok_or_else(|| anyhow!("'{}' must be a number, got {}", node.name().value(), value))
}

/// Boolean value of a node's argument; a bare node means `true`
pub fn node_bool(node: &KdlNode) -> Result<bool> {
    match first_arg(node) {
        None => Ok(true),
        Some(value) => value.as_bool().ok_or_else(|| {
            anyhow!(
                "'{}' must be #true or #false, got {}",
                node.name().value(),
                value
            )
        }),
    }
}

pub fn get_string_entry(node: &KdlNode, name: &str) -> Result<Option<String>> {
    child(node, name).map(node_string).transpose()
}

pub fn get_u64_entry(node: &KdlNode, name: &str) -> Result<Option<u64>> {
    child(node, name).map(node_u64).transpose()
}

pub fn get_usize_entry(node: &KdlNode, name: &str) -> Result<Option<usize>> {
    Ok(get_u64_entry(node, name)?.map(|v| v as usize))
}

pub fn get_bool_entry(node: &KdlNode, name: &str) -> Result<Option<bool>> {
    child(node, name).map(node_bool).transpose()
}

/// Log children of `node` that are not in `known`
pub fn warn_unknown_children(node: &KdlNode, known: &[&str]) {
    let Some(children) = node.children() else {
        return;
    };
    for child in children.nodes() {
        let name = child.name().value();
        if !known.contains(&name) {
            warn!(
                block = %node.name().value(),
                setting = %name,
                "Unknown configuration setting; ignoring"
            );
        }
    }
}
