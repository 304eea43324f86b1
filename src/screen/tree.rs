//! Indentation-delimited dump parser.
//!
//! `dumpsys activity <pkg>` prints one node per line with two spaces of
//! indentation per level. [`build_tree`] turns that into an n-ary tree whose
//! synthetic root absorbs every top-level line, so forests parse too.
//!
//! The stack rule below mirrors how the dump is produced and must stay exact:
//! callers match against literal fixtures.

use regex::Regex;
use tracing::debug;

/// Label of the synthetic root node.
pub const ROOT_LABEL: &str = "___root___";

/// Label prefix of the node under which view hierarchy paths are matched.
pub const VIEW_HIERARCHY_MARKER: &str = "View Hierarchy";

/// Index of a node inside its [`ScreenTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
struct NodeData {
    label: String,
    children: Vec<NodeId>,
}

/// Arena-backed tree built from a dump. Built per check, never mutated after.
#[derive(Debug, Clone)]
pub struct ScreenTree {
    nodes: Vec<NodeData>,
}

impl ScreenTree {
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn label(&self, id: NodeId) -> &str {
        &self.nodes[id.0].label
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    fn push(&mut self, label: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeData {
            label: label.to_string(),
            children: Vec::new(),
        });
        id
    }

    /// Depth-first labels, each indented by two spaces per level starting at
    /// `indent` for the root.
    pub fn flatten(&self, indent: usize) -> Vec<String> {
        let mut out = Vec::with_capacity(self.nodes.len());
        self.flatten_into(self.root(), indent, &mut out);
        out
    }

    fn flatten_into(&self, id: NodeId, indent: usize, out: &mut Vec<String>) {
        out.push(format!("{}{}", " ".repeat(indent), self.label(id)));
        for &child in self.children(id) {
            self.flatten_into(child, indent + 2, out);
        }
    }

    /// First direct child of `node` satisfying `predicate`.
    ///
    /// If none matches and `max_levels > 0`, each child's subtree is searched
    /// in document order with `max_levels - 1`. Non-positive `max_levels`
    /// restricts the search to direct children.
    pub fn find_child<F>(&self, node: NodeId, predicate: &F, max_levels: i32) -> Option<NodeId>
    where
        F: Fn(&str) -> bool,
    {
        let children = self.children(node);
        if let Some(&hit) = children.iter().find(|&&c| predicate(self.label(c))) {
            return Some(hit);
        }
        if max_levels <= 0 {
            return None;
        }
        children
            .iter()
            .find_map(|&c| self.find_child(c, predicate, max_levels - 1))
    }
}

/// Build a tree from dump text. Total: malformed indentation yields an odd
/// shape, never an error.
pub fn build_tree(text: &str) -> ScreenTree {
    let mut tree = ScreenTree {
        nodes: Vec::new(),
    };
    let root = tree.push(ROOT_LABEL);
    let mut stack: Vec<NodeId> = vec![root];

    let lines = text
        .split('\n')
        .map(|l| l.trim_end_matches([' ', '\r']))
        .filter(|l| !l.is_empty());

    for line in lines {
        let stripped = line.trim_start_matches(' ');
        let indent = (line.len() - stripped.len()) as i64;
        let node = tree.push(stripped);

        let Some(mut parent) = stack.pop() else {
            break;
        };
        let parent_indent = if parent == root {
            -2
        } else {
            (stack.len() as i64 - 1) * 2
        };

        if indent == parent_indent {
            // sibling
            parent = stack.pop().unwrap_or(root);
        } else if indent < parent_indent {
            let keep = (indent / 2 + 1) as usize;
            stack.truncate(keep);
            parent = stack.pop().unwrap_or(root);
        }

        tree.nodes[parent.0].children.push(node);
        stack.push(parent);
        stack.push(node);
    }

    tree
}

/// Whether `text` contains a chain of nodes matching `patterns`, starting at
/// the first child of a "View Hierarchy" node found within `max_levels` of the
/// root. Each pattern must match its node's label from the start.
pub fn matches_path(text: &str, patterns: &[Regex], max_levels: i32) -> bool {
    let tree = build_tree(text);
    let is_marker = |label: &str| label.starts_with(VIEW_HIERARCHY_MARKER);
    let Some(mut current) = tree.find_child(tree.root(), &is_marker, max_levels) else {
        debug!(max_levels, nodes = tree.len(), "no view hierarchy in dump");
        return false;
    };

    for (i, pattern) in patterns.iter().enumerate() {
        let step = |label: &str| pattern.find(label).is_some_and(|m| m.start() == 0);
        match tree.find_child(current, &step, 0) {
            Some(child) => current = child,
            None => {
                debug!(
                    step = i,
                    pattern = pattern.as_str(),
                    at = tree.label(current),
                    "view hierarchy path mismatch"
                );
                return false;
            }
        }
    }
    true
}

/// Compile view hierarchy patterns anchored at the start of the label.
pub fn compile_path<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>, regex::Error> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("^(?:{})", p.as_ref())))
        .collect()
}
