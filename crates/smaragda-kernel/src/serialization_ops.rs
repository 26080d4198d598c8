//! Serialization: template-driven export of entities to an in-memory
//! filetree, the OS bridge for that tree, and diff-based import back.
//!
//! A serialization genus describes what to export (`input`), how
//! (`output`) and the file/directory template tree. Export renders one
//! directory per entity plus a `_manifest.json` sibling mapping entities
//! (and feature files) to paths; import reads the manifest, parses YAML
//! frontmatter, and appends `attribute_set` tessellae only for keys whose
//! value actually changed. `status` is read-only on import.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smaragda_core::defs::{QueryType, TreeNodeDef};
use smaragda_core::filetree::FiletreeNode;
use smaragda_core::tessella::FeatureAttributeSet;
use smaragda_core::{ResId, Tessella, Timestamp};
use snafu::ResultExt as _;
use tracing::{debug, info};

use crate::reducers::{EntityState, FeatureState};
use crate::store_ops::ReplayFilter;
use crate::{
    branches, res, res_by_genus, serialization_runs, tessellae, tessellae_by_res,
    InvalidDefinitionSnafu, IoSnafu, Kernel, KernelError, KernelResult,
    SerializationRunRecord, WriteTransactionCtx,
};

pub(crate) const LOG_TARGET: &str = "smaragda::serialization";

/// Result of one export run.
#[derive(Debug, Clone)]
pub struct SerializationRun {
    pub run_id: u64,
    pub tree: FiletreeNode,
    pub entity_ids: Vec<ResId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportWarning {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ImportReport {
    /// Tessellae the import appended (deltas only).
    pub applied: Vec<Tessella>,
    pub warnings: Vec<ImportWarning>,
}

/// `_manifest.json` schema: entity -> directory plus feature-file paths,
/// relative to the entity directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    entities: BTreeMap<String, ManifestEntity>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ManifestEntity {
    path: String,
    #[serde(default)]
    features: BTreeMap<String, String>,
}

const MANIFEST_NAME: &str = "_manifest.json";

// ============================================================================
// Template rendering: {{entity.*}} / {{feature.*}}
// ============================================================================

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct RenderCtx<'a> {
    entity_id: ResId,
    entity: &'a EntityState,
    feature: Option<(&'a str, &'a FeatureState)>,
}

impl RenderCtx<'_> {
    fn lookup(&self, namespace: &str, key: &str) -> Option<String> {
        match namespace {
            "entity" => match key {
                "id" => Some(self.entity_id.to_string()),
                "status" => self.entity.status.clone(),
                _ => self.entity.attributes.get(key).map(value_to_text),
            },
            "feature" => {
                let (feature_id, feature) = self.feature?;
                match key {
                    "id" => Some(feature_id.to_owned()),
                    "status" => feature.status.clone(),
                    _ => feature.attributes.get(key).map(value_to_text),
                }
            }
            _ => None,
        }
    }

    /// Replace every `{{namespace.key}}` placeholder; unknown ones render
    /// empty.
    fn render(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let token = after[..end].trim();
            if let Some((namespace, key)) = token.split_once('.') {
                if let Some(value) = self.lookup(namespace, key) {
                    out.push_str(&value);
                }
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

fn slugify(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_dash = true;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn render_nodes(
    nodes: &[TreeNodeDef],
    ctx: &RenderCtx<'_>,
    base_path: &str,
    feature_files: &mut BTreeMap<String, String>,
) -> Vec<FiletreeNode> {
    let mut out = Vec::new();
    for node in nodes {
        match node {
            TreeNodeDef::File { name, template } => {
                let file_name = ctx.render(name);
                if let Some((feature_id, _)) = ctx.feature {
                    let rel = if base_path.is_empty() {
                        file_name.clone()
                    } else {
                        format!("{base_path}/{file_name}")
                    };
                    feature_files.insert(rel, feature_id.to_owned());
                }
                out.push(FiletreeNode::file(file_name, ctx.render(template)));
            }
            TreeNodeDef::Directory { name, children } => {
                let dir_name = ctx.render(name);
                let child_base = if base_path.is_empty() {
                    dir_name.clone()
                } else {
                    format!("{base_path}/{dir_name}")
                };
                let children = render_nodes(children, ctx, &child_base, feature_files);
                out.push(FiletreeNode::directory(dir_name, children));
            }
            TreeNodeDef::ForEachFeature { children } => {
                for (feature_id, feature) in &ctx.entity.features {
                    let feature_ctx = RenderCtx {
                        entity_id: ctx.entity_id,
                        entity: ctx.entity,
                        feature: Some((feature_id.as_str(), feature)),
                    };
                    out.extend(render_nodes(children, &feature_ctx, base_path, feature_files));
                }
            }
        }
    }
    out
}

// ============================================================================
// Frontmatter
// ============================================================================

/// Split a file into its YAML frontmatter map and body. `None` when the
/// file carries no `---` fenced block.
fn parse_frontmatter(content: &str) -> Option<BTreeMap<String, Value>> {
    let rest = content.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end + 1];
    let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).ok()?;
    let json = serde_json::to_value(parsed).ok()?;
    match json {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}

/// Depth-first file listing with `/`-joined relative paths.
fn walk_files<'t>(node: &'t FiletreeNode, base: &str, out: &mut Vec<(String, &'t FiletreeNode)>) {
    for child in node.children() {
        let path = if base.is_empty() {
            child.name.clone()
        } else {
            format!("{base}/{}", child.name)
        };
        if child.is_file() {
            out.push((path, child));
        } else {
            walk_files(child, &path, out);
        }
    }
}

impl Kernel {
    // ========================================================================
    // Export
    // ========================================================================

    /// Run a serialization genus: resolve the entity set, render the
    /// template tree per entity, and record the run.
    pub async fn run_serialization(
        &self,
        serialization_genus_id: ResId,
        entity_id: Option<ResId>,
    ) -> KernelResult<SerializationRun> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        self.write_with(|tx| {
            let genus = Self::scoped_genus_state(tx, serialization_genus_id, &branch)?;
            let Some(input) = genus.input.clone() else {
                return InvalidDefinitionSnafu {
                    reason: "serialization genus has no input definition",
                }
                .fail();
            };

            let entity_ids: Vec<ResId> = match input.query_type {
                QueryType::ById => {
                    let Some(entity_id) = entity_id else {
                        return InvalidDefinitionSnafu {
                            reason: "by_id serialization needs an entity_id",
                        }
                        .fail();
                    };
                    vec![entity_id]
                }
                QueryType::ByGenus => {
                    let Some(genus_name) = &input.genus_name else {
                        return InvalidDefinitionSnafu {
                            reason: "by_genus serialization needs a genus_name",
                        }
                        .fail();
                    };
                    let target_genus = Self::scoped_find_genus(tx, genus_name, &branch)?
                        .ok_or_else(|| {
                            crate::GenusNotFoundSnafu {
                                genus: genus_name.clone(),
                            }
                            .build()
                        })?
                        .0;
                    let res_by_genus_table = tx.open_table(&res_by_genus::TABLE)?;
                    res_by_genus_table
                        .range((target_genus, ResId::ZERO)..=(target_genus, ResId::MAX))?
                        .map(|row| row.map(|(k, _)| k.value().1))
                        .collect::<Result<_, _>>()?
                }
            };

            let root_name = genus
                .output
                .as_ref()
                .map(|o| o.output_shape.clone())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "export".to_owned());

            let mut manifest = Manifest::default();
            let mut children = Vec::new();
            for entity_id in &entity_ids {
                let state = {
                    let branches_table = tx.open_table(&branches::TABLE)?;
                    let tessellae_table = tx.open_table(&tessellae::TABLE)?;
                    let by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                    Self::materialize_tx(
                        *entity_id,
                        &branch,
                        &ReplayFilter::default(),
                        &branches_table,
                        &tessellae_table,
                        &by_res_table,
                    )?
                };
                if state.archived {
                    continue;
                }

                let dir_name = state
                    .attr_str("name")
                    .map(slugify)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| entity_id.to_string());

                let ctx = RenderCtx {
                    entity_id: *entity_id,
                    entity: &state,
                    feature: None,
                };
                let mut feature_files = BTreeMap::new();
                let rendered = render_nodes(&genus.tree, &ctx, "", &mut feature_files);

                manifest.entities.insert(
                    entity_id.to_string(),
                    ManifestEntity {
                        path: dir_name.clone(),
                        features: feature_files,
                    },
                );
                children.push(FiletreeNode::directory(dir_name, rendered));
            }

            children.push(FiletreeNode::file(
                MANIFEST_NAME,
                serde_json::to_string_pretty(&manifest)
                    .expect("Manifest serialization can't fail"),
            ));
            let tree = FiletreeNode::directory(root_name, children);

            let file_count = {
                let mut count = Vec::new();
                walk_files(&tree, "", &mut count);
                count.len() as u64
            };

            let run_id = {
                let mut runs_table = tx.open_table(&serialization_runs::TABLE)?;
                let run_id = runs_table.last()?.map(|(k, _)| k.value()).unwrap_or(0) + 1;
                runs_table.insert(
                    &run_id,
                    &SerializationRunRecord {
                        serialization_genus_id,
                        entity_ids: entity_ids.clone(),
                        file_count,
                        created_at: now,
                    },
                )?;
                run_id
            };

            info!(
                target: LOG_TARGET,
                genus = %serialization_genus_id,
                run_id,
                entities = entity_ids.len(),
                files = file_count,
                "Serialization run"
            );

            Ok(SerializationRun {
                run_id,
                tree,
                entity_ids,
            })
        })
        .await
    }

    // ========================================================================
    // OS bridge
    // ========================================================================

    /// Write an in-memory filetree under `target` (the node's own name
    /// becomes a directory or file inside it).
    pub async fn write_filetree(
        &self,
        tree: &FiletreeNode,
        target: impl AsRef<Path>,
    ) -> KernelResult<()> {
        let tree = tree.clone();
        let target = target.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || write_node(&tree, &target))
            .await
            .context(crate::JoinSnafu)
            .map_err(KernelError::from)?
    }

    /// Read an OS directory (or file) back into an in-memory filetree.
    pub async fn read_filetree(
        &self,
        source: impl AsRef<Path>,
    ) -> KernelResult<FiletreeNode> {
        let source = source.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || read_node(&source))
            .await
            .context(crate::JoinSnafu)
            .map_err(KernelError::from)?
    }

    // ========================================================================
    // Import
    // ========================================================================

    /// Import an exported tree: diff frontmatter against the current
    /// materialized state and append only the changed attributes.
    pub async fn import_filetree(&self, tree: &FiletreeNode) -> KernelResult<ImportReport> {
        let branch = self.current_branch();
        let now = Timestamp::now();
        let tree = tree.clone();
        self.write_with(|tx| {
            let manifest: Manifest = {
                let Some(manifest_node) = tree.child(MANIFEST_NAME) else {
                    return InvalidDefinitionSnafu {
                        reason: format!("tree has no {MANIFEST_NAME}"),
                    }
                    .fail();
                };
                serde_json::from_str(manifest_node.content.as_deref().unwrap_or(""))
                    .map_err(|e| {
                        InvalidDefinitionSnafu {
                            reason: format!("unreadable {MANIFEST_NAME}: {e}"),
                        }
                        .build()
                    })?
            };

            let mut applied = Vec::new();
            let mut warnings = Vec::new();

            for (entity_id_str, entry) in &manifest.entities {
                let Ok(entity_id) = entity_id_str.parse::<ResId>() else {
                    warnings.push(ImportWarning {
                        path: entry.path.clone(),
                        message: format!("manifest entity id {entity_id_str:?} is invalid"),
                    });
                    continue;
                };
                let Some(entity_dir) = tree.child(&entry.path) else {
                    warnings.push(ImportWarning {
                        path: entry.path.clone(),
                        message: "entity directory missing from tree".to_owned(),
                    });
                    continue;
                };

                let state = Self::scoped_entity_state(tx, entity_id, &branch)?;

                let mut files = Vec::new();
                walk_files(entity_dir, "", &mut files);
                for (rel_path, file) in files {
                    let Some(front) =
                        file.content.as_deref().and_then(parse_frontmatter)
                    else {
                        continue;
                    };
                    let display_path = format!("{}/{}", entry.path, rel_path);
                    let feature_id = entry.features.get(&rel_path);

                    self.import_frontmatter_tx(
                        entity_id,
                        &state,
                        feature_id.map(String::as_str),
                        &front,
                        &display_path,
                        &branch,
                        now,
                        tx,
                        &mut applied,
                        &mut warnings,
                    )?;
                }
            }

            debug!(
                target: LOG_TARGET,
                applied = applied.len(),
                warnings = warnings.len(),
                "Import finished"
            );
            self.notify_appended(tx, applied.clone());
            Ok(ImportReport { applied, warnings })
        })
        .await
    }

    /// Diff one frontmatter map against entity (or feature) state and
    /// append deltas. `status` keys are skipped with a warning pointing at
    /// `transition_status`.
    #[allow(clippy::too_many_arguments)]
    fn import_frontmatter_tx(
        &self,
        entity_id: ResId,
        state: &EntityState,
        feature_id: Option<&str>,
        front: &BTreeMap<String, Value>,
        display_path: &str,
        branch: &str,
        now: Timestamp,
        tx: &WriteTransactionCtx,
        applied: &mut Vec<Tessella>,
        warnings: &mut Vec<ImportWarning>,
    ) -> KernelResult<()> {
        let current: &BTreeMap<String, Value> = match feature_id {
            Some(feature_id) => match state.features.get(feature_id) {
                Some(feature) => &feature.attributes,
                None => {
                    warnings.push(ImportWarning {
                        path: display_path.to_owned(),
                        message: format!("feature {feature_id:?} no longer exists"),
                    });
                    return Ok(());
                }
            },
            None => &state.attributes,
        };

        for (key, new_value) in front {
            if key == "status" {
                let unchanged = match feature_id {
                    Some(feature_id) => state
                        .features
                        .get(feature_id)
                        .and_then(|f| f.status.as_deref()),
                    None => state.status.as_deref(),
                } == new_value.as_str();
                if !unchanged {
                    warnings.push(ImportWarning {
                        path: display_path.to_owned(),
                        message: "status is read-only in frontmatter; use transition_status"
                            .to_owned(),
                    });
                }
                continue;
            }

            if current.get(key) == Some(new_value) {
                continue;
            }

            let result = match feature_id {
                Some(feature_id) => {
                    // Feature edits go through the raw append: the gate and
                    // type validation already ran when the file was edited
                    // through the API; import only mirrors text changes.
                    let res_table = tx.open_table(&res::TABLE)?;
                    let mut tessellae_table = tx.open_table(&tessellae::TABLE)?;
                    let mut by_res_table = tx.open_table(&tessellae_by_res::TABLE)?;
                    Self::append_content_tx(
                        entity_id,
                        &FeatureAttributeSet {
                            feature_id: feature_id.to_owned(),
                            key: key.clone(),
                            value: new_value.clone(),
                        },
                        branch,
                        Some("import"),
                        now,
                        &res_table,
                        &mut tessellae_table,
                        &mut by_res_table,
                    )
                }
                None => Self::set_attribute_tx(
                    entity_id,
                    key,
                    new_value.clone(),
                    branch,
                    Some("import"),
                    now,
                    tx,
                ),
            };

            match result {
                Ok(tessella) => applied.push(tessella),
                Err(KernelError::Db { source }) => return Err(source.into()),
                Err(err) => warnings.push(ImportWarning {
                    path: display_path.to_owned(),
                    message: err.to_string(),
                }),
            }
        }

        Ok(())
    }
}

// ============================================================================
// std::fs workers (run on the blocking pool)
// ============================================================================

fn write_node(node: &FiletreeNode, target: &Path) -> KernelResult<()> {
    let path = target.join(&node.name);
    if node.is_directory() {
        std::fs::create_dir_all(&path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        for child in node.children() {
            write_node(child, &path)?;
        }
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context(IoSnafu {
                path: parent.display().to_string(),
            })?;
        }
        std::fs::write(&path, node.content.as_deref().unwrap_or("")).context(IoSnafu {
            path: path.display().to_string(),
        })?;
    }
    Ok(())
}

fn read_node(source: &PathBuf) -> KernelResult<FiletreeNode> {
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_owned());
    let metadata = std::fs::metadata(source).context(IoSnafu {
        path: source.display().to_string(),
    })?;

    if metadata.is_dir() {
        let mut children = Vec::new();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(source)
            .context(IoSnafu {
                path: source.display().to_string(),
            })?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .context(IoSnafu {
                path: source.display().to_string(),
            })?;
        entries.sort();
        for entry in entries {
            children.push(read_node(&entry)?);
        }
        Ok(FiletreeNode::directory(name, children))
    } else {
        let content = std::fs::read_to_string(source).context(IoSnafu {
            path: source.display().to_string(),
        })?;
        Ok(FiletreeNode::file(name, content))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn templates_render_entity_and_feature_fields() {
        let mut entity = EntityState::default();
        entity
            .attributes
            .insert("name".to_owned(), json!("Engine Room"));
        entity.status = Some("active".to_owned());
        let ctx = RenderCtx {
            entity_id: ResId::ZERO,
            entity: &entity,
            feature: None,
        };
        assert_eq!(
            ctx.render("# {{entity.name}} ({{entity.status}})"),
            "# Engine Room (active)"
        );
        // Unknown placeholders render empty.
        assert_eq!(ctx.render("[{{entity.missing}}]"), "[]");
        // Placeholders without a namespace stay unrendered but don't eat
        // the rest of the template.
        assert_eq!(ctx.render("a {{nodot}} b"), "a  b");
    }

    #[test]
    fn frontmatter_parses_and_rejects_fenceless_files() {
        let content = "---\ntitle: Hello\ncost: 10\n---\nbody text\n";
        let front = parse_frontmatter(content).expect("Has frontmatter");
        assert_eq!(front.get("title"), Some(&json!("Hello")));
        assert_eq!(front.get("cost"), Some(&json!(10)));

        assert!(parse_frontmatter("no fences here").is_none());
        assert!(parse_frontmatter("---\nunterminated: yes\n").is_none());
    }

    #[test]
    fn slugify_is_filesystem_safe() {
        assert_eq!(slugify("Engine Room #2"), "engine-room-2");
        assert_eq!(slugify("  "), "");
    }
}
