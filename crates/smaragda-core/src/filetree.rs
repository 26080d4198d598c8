//! In-memory filetree exchanged with the serialization layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiletreeNodeType {
    File,
    Directory,
}

/// One node of an in-memory filetree. Files carry UTF-8 `content`,
/// directories carry `children`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiletreeNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: FiletreeNodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<FiletreeNode>>,
}

impl FiletreeNode {
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            node_type: FiletreeNodeType::File,
            content: Some(content.into()),
            children: None,
        }
    }

    pub fn directory(name: impl Into<String>, children: Vec<FiletreeNode>) -> Self {
        Self {
            name: name.into(),
            node_type: FiletreeNodeType::Directory,
            content: None,
            children: Some(children),
        }
    }

    pub fn is_file(&self) -> bool {
        self.node_type == FiletreeNodeType::File
    }

    pub fn is_directory(&self) -> bool {
        self.node_type == FiletreeNodeType::Directory
    }

    pub fn children(&self) -> &[FiletreeNode] {
        self.children.as_deref().unwrap_or(&[])
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&FiletreeNode> {
        self.children().iter().find(|c| c.name == name)
    }
}
