use std::collections::BTreeMap;

use serde_json::{json, Value};
use smaragda_core::defs::{
    AttrType, AttributeDef, Cardinality, GenusDef, GenusEvolution, GenusKind, LaneDef,
    ParameterDef, QueryType, ResourceDef, RoleDef, SerializationInputDef, SerializationOutputDef,
    SideEffectDef, StateDef, StepDef, StepKind, TransitionDef, TreeNodeDef,
};
use smaragda_core::filetree::FiletreeNode;
use smaragda_core::{ResId, Timestamp};
use smaragda_util_error::BoxedErrorResult;
use tempfile::{tempdir, TempDir};
use tracing::info;

use crate::{
    ActionOutcome, Kernel, KernelError, ListFilter, MergeOutcome, ProcessStatus, ReplayFilter,
    ScheduleDef, ScheduleTarget, SearchOpts, StepStatus, SyncPullPayload, SyncResRow,
    SyncTessellaRow, TickOutcome,
};

pub(crate) async fn temp_kernel() -> BoxedErrorResult<(TempDir, Kernel)> {
    let dir = tempdir()?;
    let kernel = Kernel::open(dir.path().join("db.redb")).await?;
    Ok((dir, kernel))
}

fn attr(name: &str, attr_type: AttrType, required: bool) -> AttributeDef {
    AttributeDef {
        name: name.to_owned(),
        attr_type,
        required,
    }
}

fn state(name: &str, initial: bool) -> StateDef {
    StateDef {
        name: name.to_owned(),
        initial,
    }
}

fn trans(from: &str, to: &str) -> TransitionDef {
    TransitionDef {
        from: from.to_owned(),
        to: to.to_owned(),
    }
}

fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

fn server_genus() -> GenusDef {
    GenusDef::builder()
        .name("Server")
        .attributes(vec![
            attr("ip_address", AttrType::Text, true),
            attr("deployed_at", AttrType::Text, false),
            attr("version", AttrType::Text, false),
            attr("cost", AttrType::Number, false),
        ])
        .states(vec![
            state("provisioning", true),
            state("active", false),
            state("deployed", false),
            state("decommissioned", false),
        ])
        .transitions(vec![
            trans("provisioning", "active"),
            trans("active", "deployed"),
            trans("active", "decommissioned"),
            trans("deployed", "decommissioned"),
        ])
        .build()
}

fn deploy_action() -> GenusDef {
    GenusDef::builder()
        .name("deploy")
        .kind(GenusKind::Action)
        .resources(vec![ResourceDef {
            name: "server".to_owned(),
            genus_name: "Server".to_owned(),
            required_status: Some("active".to_owned()),
        }])
        .parameters(vec![ParameterDef {
            name: "version".to_owned(),
            param_type: AttrType::Text,
            required: true,
        }])
        .handler(vec![
            SideEffectDef::SetAttribute {
                res: "server".to_owned(),
                key: "deployed_at".to_owned(),
                value: json!("$now"),
            },
            SideEffectDef::SetAttribute {
                res: "server".to_owned(),
                key: "version".to_owned(),
                value: json!("$param.version"),
            },
            SideEffectDef::CreateLog {
                res: Some("server".to_owned()),
                message: "Deployed $param.version".to_owned(),
                severity: None,
            },
            SideEffectDef::TransitionStatus {
                res: "server".to_owned(),
                target: "deployed".to_owned(),
            },
        ])
        .build()
}

// ============================================================================
// Bootstrap & store
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_bootstrap_is_idempotent() -> BoxedErrorResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("db.redb");

    let kernel = Kernel::open(&path).await?;
    let head_after_first = kernel.head().await?;
    assert!(0 < head_after_first, "Bootstrap must write sentinel genera");
    assert!(kernel.get_res(ResId::META).await?.is_some());
    drop(kernel);

    let kernel = Kernel::open(&path).await?;
    let head_after_second = kernel.head().await?;
    assert_eq!(
        head_after_first, head_after_second,
        "Reopening must not duplicate the bootstrap"
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_append_to_missing_res_fails() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let err = kernel
        .append(ResId::generate(), "created", json!({}), Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::ResNotFound { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_replay_missing_res_is_empty() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let log = kernel
        .replay(ResId::generate(), ReplayFilter::default())
        .await?;
    assert!(log.is_empty());
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_materialize_is_deterministic_and_point_in_time() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;
    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    let first_write = kernel
        .set_attribute(server, "version", json!("1.0"))
        .await?;
    kernel.set_attribute(server, "version", json!("2.0")).await?;

    let now_state = kernel.materialize(server, ReplayFilter::default()).await?;
    let again = kernel.materialize(server, ReplayFilter::default()).await?;
    assert_eq!(now_state, again, "Replaying twice yields identical state");
    assert_eq!(now_state.attr_str("version"), Some("2.0"));

    let old_state = kernel
        .materialize(server, ReplayFilter::up_to(first_write.id))
        .await?;
    assert_eq!(
        old_state.attr_str("version"),
        Some("1.0"),
        "up_to must ignore later tessellae"
    );
    Ok(())
}

// ============================================================================
// Scenario: typed entity lifecycle
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_entity_state_machine() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;

    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    // provisioning -> decommissioned is not a defined transition
    let err = kernel
        .transition_status(server, "decommissioned")
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::NoValidTransition { .. }), "{err}");

    kernel.transition_status(server, "active").await?;

    let state = kernel.materialize(server, ReplayFilter::default()).await?;
    assert_eq!(state.attr_str("ip_address"), Some("10.0.0.1"));
    assert_eq!(state.status.as_deref(), Some("active"));

    let err = kernel
        .transition_status(server, "no_such_state")
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::StateUndefined { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_attribute_validation() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;
    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    let err = kernel
        .set_attribute(server, "no_such_attribute", json!("x"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::UnknownAttribute { .. }), "{err}");

    let err = kernel
        .set_attribute(server, "cost", json!("not a number"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::TypeMismatch { .. }));
    assert!(
        err.to_string().contains("expected number, got string"),
        "message should name the violated contract: {err}"
    );
    Ok(())
}

// ============================================================================
// Scenario: action execution
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_execute_action_end_to_end() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let server_genus_id = kernel.define_genus(server_genus()).await?;
    let deploy = kernel.define_genus(deploy_action()).await?;

    let server = kernel
        .create_entity(server_genus_id, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    // Still provisioning: resource status check fails as data, not error.
    let outcome = kernel
        .execute_action(
            deploy,
            BTreeMap::from([("server".to_owned(), server)]),
            BTreeMap::from([("version".to_owned(), json!("2.0"))]),
            Some("user:alice"),
        )
        .await?;
    let error = outcome.error().expect("Must fail on status").to_owned();
    assert!(error.contains("active"), "error mentions status: {error}");

    kernel.transition_status(server, "active").await?;

    // Missing required parameter
    let outcome = kernel
        .execute_action(
            deploy,
            BTreeMap::from([("server".to_owned(), server)]),
            BTreeMap::new(),
            None,
        )
        .await?;
    assert!(outcome.error().expect("Must fail").contains("version"));

    let outcome = kernel
        .execute_action(
            deploy,
            BTreeMap::from([("server".to_owned(), server)]),
            BTreeMap::from([("version".to_owned(), json!("2.0"))]),
            Some("user:alice"),
        )
        .await?;
    let ActionOutcome::Completed {
        action_taken_id,
        tessella_ids,
    } = outcome
    else {
        panic!("Deploy must complete: {outcome:?}");
    };
    assert!(!tessella_ids.is_empty());

    let state = kernel.materialize(server, ReplayFilter::default()).await?;
    assert_eq!(state.status.as_deref(), Some("deployed"));
    assert_eq!(state.attr_str("version"), Some("2.0"));
    assert!(
        state.attr_str("deployed_at").is_some_and(|s| s.ends_with('Z')),
        "$now must substitute an ISO timestamp"
    );

    // The Log entity exists with the substituted message.
    let (logs, _) = kernel.list_entities(ResId::LOG, ListFilter::default()).await?;
    assert!(
        logs.iter()
            .any(|l| l.state.attr_str("message") == Some("Deployed 2.0")),
        "log message must carry the substituted parameter"
    );

    // Every tessella the action produced is labeled with it in history.
    let history = kernel.get_history(server).await?;
    let labeled: Vec<_> = history
        .iter()
        .filter(|e| e.action_taken_id == Some(action_taken_id))
        .collect();
    assert_eq!(
        labeled.len(),
        3,
        "deployed_at, version and status on the server come from the action"
    );
    assert!(labeled.iter().all(|e| e.action_genus_id == Some(deploy)));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_action_handler_validation_rejects_unknown_tokens() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    kernel.define_genus(server_genus()).await?;

    let bad = GenusDef::builder()
        .name("bad-action")
        .kind(GenusKind::Action)
        .resources(vec![ResourceDef {
            name: "server".to_owned(),
            genus_name: "Server".to_owned(),
            required_status: None,
        }])
        .handler(vec![SideEffectDef::CreateLog {
            res: None,
            message: "version is $param.version".to_owned(),
            severity: None,
        }])
        .build();
    let err = kernel.define_genus(bad).await.unwrap_err();
    assert!(
        matches!(err, KernelError::UndefinedTokenReference { .. }),
        "{err}"
    );

    // Validation ran before any append: no half-defined genus by that name.
    assert!(kernel.find_genus_by_name("bad-action").await?.is_none());
    Ok(())
}

// ============================================================================
// Scenario: feature editability
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_feature_edit_gate() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;

    let issue_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Issue")
                .attributes(vec![attr("title", AttrType::Text, true)])
                .states(vec![state("draft", true), state("archived", false)])
                .transitions(vec![trans("draft", "archived"), trans("archived", "draft")])
                .build(),
        )
        .await?;
    let page_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Page")
                .kind(GenusKind::Feature)
                .attributes(vec![attr("content", AttrType::Text, false)])
                .meta(BTreeMap::from([(
                    "editable_parent_statuses".to_owned(),
                    json!(["draft"]),
                )]))
                .build(),
        )
        .await?;

    let issue = kernel
        .create_entity(issue_genus, attrs(&[("title", json!("Bug 1"))]))
        .await?;
    let page = kernel
        .create_feature(issue, page_genus, attrs(&[("content", json!("first"))]))
        .await?;

    kernel.transition_status(issue, "archived").await?;
    let err = kernel
        .set_feature_attribute(issue, &page, "content", json!("second"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::FeatureNotEditable { .. }), "{err}");

    kernel.transition_status(issue, "draft").await?;
    kernel
        .set_feature_attribute(issue, &page, "content", json!("second"))
        .await?;

    let state = kernel.materialize(issue, ReplayFilter::default()).await?;
    let feature = state.features.get(&page).expect("Feature exists");
    assert_eq!(
        feature.attributes.get("content"),
        Some(&json!("second"))
    );
    Ok(())
}

// ============================================================================
// Scenario: branches & merge
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_branch_merge_carries_changes() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let doc_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Doc")
                .attributes(vec![attr("title", AttrType::Text, false)])
                .build(),
        )
        .await?;
    let doc = kernel
        .create_entity(doc_genus, attrs(&[("title", json!("old"))]))
        .await?;

    kernel.create_branch("experiment", None).await?;
    kernel.switch_branch("experiment").await?;
    kernel.set_attribute(doc, "title", json!("new")).await?;

    // Main does not see the branch write before the merge.
    let on_main = kernel
        .materialize(doc, ReplayFilter::on_branch("main"))
        .await?;
    assert_eq!(on_main.attr_str("title"), Some("old"));

    let outcome = kernel.merge_branch("experiment", None, false).await?;
    assert!(outcome.is_merged(), "{outcome:?}");
    assert_eq!(kernel.current_branch(), "main");

    let merged = kernel.materialize(doc, ReplayFilter::default()).await?;
    assert_eq!(merged.attr_str("title"), Some("new"));

    // Merged branches are terminal.
    let err = kernel.switch_branch("experiment").await.unwrap_err();
    assert!(matches!(err, KernelError::BranchUnreachable { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_branch_isolation_after_branch_point() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let doc_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Doc")
                .attributes(vec![attr("title", AttrType::Text, false)])
                .build(),
        )
        .await?;
    let doc = kernel
        .create_entity(doc_genus, attrs(&[("title", json!("before"))]))
        .await?;

    kernel.create_branch("experiment", None).await?;
    // Written on main after the branch point: invisible to the branch.
    kernel.set_attribute(doc, "title", json!("after")).await?;

    let on_branch = kernel
        .materialize(doc, ReplayFilter::on_branch("experiment"))
        .await?;
    assert_eq!(on_branch.attr_str("title"), Some("before"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_merge_conflict_detection_and_force() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let doc_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Doc")
                .attributes(vec![attr("title", AttrType::Text, false)])
                .build(),
        )
        .await?;
    let doc = kernel
        .create_entity(doc_genus, attrs(&[("title", json!("old"))]))
        .await?;

    kernel.create_branch("experiment", None).await?;
    kernel.switch_branch("experiment").await?;
    kernel.set_attribute(doc, "title", json!("ours")).await?;
    kernel.switch_branch("main").await?;
    kernel.set_attribute(doc, "title", json!("theirs")).await?;

    let outcome = kernel.merge_branch("experiment", None, false).await?;
    let MergeOutcome::Conflicted { conflicts } = outcome else {
        panic!("Must conflict: {outcome:?}");
    };
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].res_id, doc);
    assert_eq!(conflicts[0].field, "title");
    assert_eq!(conflicts[0].source_value, json!("ours"));
    assert_eq!(conflicts[0].target_value, json!("theirs"));

    let outcome = kernel.merge_branch("experiment", None, true).await?;
    assert!(outcome.is_merged());
    let state = kernel.materialize(doc, ReplayFilter::default()).await?;
    assert_eq!(
        state.attr_str("title"),
        Some("ours"),
        "forced merge overwrites the target"
    );
    Ok(())
}

// ============================================================================
// Relationships
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_relationship_roles_and_index() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let person = kernel
        .define_genus(
            GenusDef::builder()
                .name("Person")
                .attributes(vec![attr("name", AttrType::Text, true)])
                .build(),
        )
        .await?;
    let ship = kernel
        .define_genus(
            GenusDef::builder()
                .name("Ship")
                .attributes(vec![attr("name", AttrType::Text, true)])
                .build(),
        )
        .await?;
    let crewing = kernel
        .define_genus(
            GenusDef::builder()
                .name("Crewing")
                .kind(GenusKind::Relationship)
                .roles(vec![
                    RoleDef {
                        name: "vessel".to_owned(),
                        cardinality: Cardinality::One,
                        valid_member_genera: vec!["Ship".to_owned()],
                    },
                    RoleDef {
                        name: "crew".to_owned(),
                        cardinality: Cardinality::OneOrMore,
                        valid_member_genera: vec!["Person".to_owned()],
                    },
                ])
                .build(),
        )
        .await?;

    let alice = kernel
        .create_entity(person, attrs(&[("name", json!("Alice"))]))
        .await?;
    let bob = kernel
        .create_entity(person, attrs(&[("name", json!("Bob"))]))
        .await?;
    let boat = kernel
        .create_entity(ship, attrs(&[("name", json!("Argo"))]))
        .await?;

    // Required role missing
    let err = kernel
        .create_relationship(
            crewing,
            BTreeMap::from([("crew".to_owned(), vec![alice])]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::MissingRequiredRole { .. }), "{err}");

    // Wrong member genus
    let err = kernel
        .create_relationship(
            crewing,
            BTreeMap::from([
                ("vessel".to_owned(), vec![alice]),
                ("crew".to_owned(), vec![bob]),
            ]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::MemberGenusMismatch { .. }), "{err}");

    let rel = kernel
        .create_relationship(
            crewing,
            BTreeMap::from([
                ("vessel".to_owned(), vec![boat]),
                ("crew".to_owned(), vec![alice]),
            ]),
        )
        .await?;

    kernel.add_member(rel, "crew", bob).await?;

    // `one` cardinality rejects a second vessel
    let err = kernel.add_member(rel, "vessel", alice).await.unwrap_err();
    assert!(
        matches!(err, KernelError::RoleCardinalityViolation { .. })
            || matches!(err, KernelError::MemberGenusMismatch { .. }),
        "{err}"
    );

    // Unknown role
    let err = kernel.add_member(rel, "captain", bob).await.unwrap_err();
    assert!(matches!(err, KernelError::UnknownRole { .. }), "{err}");

    // The materialized members map matches the secondary index.
    let state = kernel.materialize(rel, ReplayFilter::default()).await?;
    assert_eq!(state.members["crew"], vec![alice, bob]);
    assert_eq!(state.members["vessel"], vec![boat]);

    let refs = kernel.relationships_for(alice, Some("crew")).await?;
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].relationship_id, rel);

    kernel.remove_member(rel, "crew", alice).await?;
    assert!(kernel.relationships_for(alice, None).await?.is_empty());

    // Removing the last crew member would violate one_or_more.
    let err = kernel.remove_member(rel, "crew", bob).await.unwrap_err();
    assert!(
        matches!(err, KernelError::RoleCardinalityViolation { .. }),
        "{err}"
    );
    Ok(())
}

// ============================================================================
// Genus evolution & deprecation
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_evolution_is_additive_and_idempotent() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;

    // Everything already present: nothing to append.
    let appended = kernel
        .evolve_genus(
            genus,
            GenusEvolution::builder()
                .attributes(vec![attr("ip_address", AttrType::Text, true)])
                .states(vec![state("active", false)])
                .transitions(vec![trans("provisioning", "active")])
                .build(),
        )
        .await?;
    assert!(appended.is_empty(), "idempotent evolution appends nothing");

    let appended = kernel
        .evolve_genus(
            genus,
            GenusEvolution::builder()
                .attributes(vec![attr("region", AttrType::Text, false)])
                .build(),
        )
        .await?;
    assert_eq!(appended.len(), 1);

    let state = kernel.materialize_genus(genus).await?;
    assert!(state.attributes.contains_key("region"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_deprecation_lifecycle() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;

    kernel.deprecate_genus(genus).await?;
    let err = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::DeprecatedGenus { .. }), "{err}");

    // Evolution auto-restores.
    kernel
        .evolve_genus(
            genus,
            GenusEvolution::builder()
                .attributes(vec![attr("region", AttrType::Text, false)])
                .build(),
        )
        .await?;
    kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    // Sentinels cannot be deprecated.
    let err = kernel.deprecate_genus(ResId::TASK).await.unwrap_err();
    assert!(matches!(err, KernelError::SentinelProtected { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_archived_taxonomy_blocks_restore() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let taxonomy = kernel.create_taxonomy("Infrastructure", None, vec![]).await?;
    let mut def = server_genus();
    def.taxonomy_id = Some(taxonomy);
    let genus = kernel.define_genus(def).await?;

    kernel.deprecate_genus(genus).await?;
    kernel.archive_taxonomy(taxonomy).await?;

    let err = kernel.restore_genus(genus).await.unwrap_err();
    assert!(matches!(err, KernelError::ArchivedTaxonomy { .. }), "{err}");

    kernel.restore_taxonomy(taxonomy).await?;
    kernel.restore_genus(genus).await?;

    let science = kernel.describe_science(ResId::DEFAULT_SCIENCE).await?;
    assert!(
        science
            .taxonomies
            .iter()
            .any(|t| t.taxonomy_id == taxonomy),
        "taxonomy belongs to the default science"
    );
    Ok(())
}

// ============================================================================
// Errors & health
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_error_acknowledgement_and_health() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;
    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    let error = kernel
        .create_entity(
            ResId::ERROR,
            attrs(&[
                ("message", json!("disk full")),
                ("res_id", json!(server.to_string())),
            ]),
        )
        .await?;

    let report = kernel.evaluate_health(server).await?;
    assert!(!report.healthy);
    assert!(report
        .issues
        .iter()
        .any(|i| i.kind == "unacknowledged_error"));

    kernel.acknowledge_error(error).await?;
    let report = kernel.evaluate_health(server).await?;
    assert!(report.healthy, "{report:?}");

    // Acknowledging twice has no valid transition.
    let err = kernel.acknowledge_error(error).await.unwrap_err();
    assert!(matches!(err, KernelError::NoValidTransition { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_list_unhealthy_finds_missing_required() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;

    // ip_address is required but unset.
    let server = kernel.create_entity(genus, BTreeMap::new()).await?;

    let unhealthy = kernel.list_unhealthy(Some(genus)).await?;
    assert_eq!(unhealthy.len(), 1);
    assert_eq!(unhealthy[0].0, server);
    assert!(unhealthy[0]
        .1
        .issues
        .iter()
        .any(|i| i.kind == "missing_required_attribute"));

    kernel
        .set_attribute(server, "ip_address", json!("10.0.0.2"))
        .await?;
    assert!(kernel.list_unhealthy(Some(genus)).await?.is_empty());
    Ok(())
}

// ============================================================================
// Workspaces & search
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_workspace_scoping() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Doc")
                .attributes(vec![attr("title", AttrType::Text, false)])
                .build(),
        )
        .await?;

    let global_doc = kernel
        .create_entity(genus, attrs(&[("title", json!("global"))]))
        .await?;

    kernel.create_workspace("alpha").await?;
    kernel.set_current_workspace(Some("alpha")).await?;
    let scoped_doc = kernel
        .create_entity(genus, attrs(&[("title", json!("scoped"))]))
        .await?;

    // Inside the workspace: both visible (no workspace means global).
    let (listed, _) = kernel.list_entities(genus, ListFilter::default()).await?;
    let ids: Vec<ResId> = listed.iter().map(|l| l.res_id).collect();
    assert!(ids.contains(&global_doc) && ids.contains(&scoped_doc));

    // Outside: only the global one.
    kernel.set_current_workspace(None).await?;
    let (listed, _) = kernel.list_entities(genus, ListFilter::default()).await?;
    let ids: Vec<ResId> = listed.iter().map(|l| l.res_id).collect();
    assert!(ids.contains(&global_doc) && !ids.contains(&scoped_doc));

    let (listed, _) = kernel
        .list_entities(
            genus,
            ListFilter {
                all_workspaces: true,
                ..ListFilter::default()
            },
        )
        .await?;
    assert_eq!(listed.len(), 2);

    // A non-empty workspace cannot be deleted.
    let err = kernel.delete_workspace("alpha").await.unwrap_err();
    assert!(matches!(err, KernelError::WorkspaceNotEmpty { .. }), "{err}");

    kernel.create_workspace("beta").await?;
    let moved = kernel.merge_workspaces("alpha", "beta").await?;
    assert_eq!(moved, 1);

    let record = kernel.get_res(scoped_doc).await?.expect("Res exists");
    assert_eq!(record.workspace_id.as_deref(), Some("beta"));

    // Duplicate names are rejected.
    let err = kernel.create_workspace("beta").await.unwrap_err();
    assert!(matches!(err, KernelError::DuplicateName { .. }), "{err}");
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_search_matches_string_attributes_only() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Doc")
                .attributes(vec![
                    attr("title", AttrType::Text, false),
                    attr("pages", AttrType::Number, false),
                ])
                .build(),
        )
        .await?;
    kernel
        .create_entity(
            genus,
            attrs(&[("title", json!("The Emerald Tablet")), ("pages", json!(42))]),
        )
        .await?;
    kernel
        .create_entity(genus, attrs(&[("title", json!("Other"))]))
        .await?;

    let hits = kernel.search_entities("emerald", SearchOpts::default()).await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].matched_attributes, vec!["title".to_owned()]);

    // Numbers are not searched even when the digits would match.
    let hits = kernel.search_entities("42", SearchOpts::default()).await?;
    assert!(hits.is_empty());
    Ok(())
}

// ============================================================================
// Processes
// ============================================================================

fn gated_process(publish_action: &str) -> GenusDef {
    GenusDef::builder()
        .name("Publication")
        .kind(GenusKind::Process)
        .lanes(vec![
            LaneDef {
                name: "writing".to_owned(),
                position: 0,
            },
            LaneDef {
                name: "review".to_owned(),
                position: 1,
            },
            LaneDef {
                name: "finish".to_owned(),
                position: 2,
            },
        ])
        .steps(vec![
            StepDef {
                name: "draft".to_owned(),
                lane: "writing".to_owned(),
                position: 0,
                kind: StepKind::TaskStep {
                    task_title: "Write the draft".to_owned(),
                    priority: Some("high".to_owned()),
                },
            },
            StepDef {
                name: "review".to_owned(),
                lane: "review".to_owned(),
                position: 0,
                kind: StepKind::TaskStep {
                    task_title: "Review the draft".to_owned(),
                    priority: None,
                },
            },
            StepDef {
                name: "convergence".to_owned(),
                lane: "finish".to_owned(),
                position: 0,
                kind: StepKind::GateStep {
                    gate_conditions: vec!["draft".to_owned(), "review".to_owned()],
                },
            },
            StepDef {
                name: "publish".to_owned(),
                lane: "finish".to_owned(),
                position: 1,
                kind: StepKind::ActionStep {
                    action_name: publish_action.to_owned(),
                    action_resource_bindings: BTreeMap::from([(
                        "article".to_owned(),
                        "$context.res_id".to_owned(),
                    )]),
                },
            },
        ])
        .build()
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_gated_process_completes() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;

    let article_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Article")
                .attributes(vec![attr("title", AttrType::Text, true)])
                .states(vec![state("draft", true), state("published", false)])
                .transitions(vec![trans("draft", "published")])
                .build(),
        )
        .await?;
    kernel
        .define_genus(
            GenusDef::builder()
                .name("publish-article")
                .kind(GenusKind::Action)
                .resources(vec![ResourceDef {
                    name: "article".to_owned(),
                    genus_name: "Article".to_owned(),
                    required_status: None,
                }])
                .handler(vec![SideEffectDef::TransitionStatus {
                    res: "article".to_owned(),
                    target: "published".to_owned(),
                }])
                .build(),
        )
        .await?;
    let process_genus = kernel
        .define_process_genus(gated_process("publish-article"))
        .await?;

    let article = kernel
        .create_entity(article_genus, attrs(&[("title", json!("Kernel"))]))
        .await?;

    let instance = kernel.start_process(process_genus, Some(article)).await?;

    let state = kernel.materialize_process_instance(instance).await?;
    assert_eq!(state.status, ProcessStatus::Running);
    assert_eq!(state.steps["draft"].status, StepStatus::Active);
    assert_eq!(state.steps["review"].status, StepStatus::Active);
    assert!(
        !state.steps.contains_key("convergence"),
        "gate waits for its conditions"
    );

    let draft_task = state.steps["draft"].task_id.expect("Task created");
    let review_task = state.steps["review"].task_id.expect("Task created");

    // The spawned task carries the process context.
    let task_state = kernel.materialize(draft_task, ReplayFilter::default()).await?;
    assert_eq!(task_state.attr_str("title"), Some("Write the draft"));
    assert_eq!(task_state.attr_str("step_name"), Some("draft"));

    let completion = kernel.complete_task(draft_task, None).await?;
    assert_eq!(completion.advanced_instance, Some(instance));
    let state = kernel.materialize_process_instance(instance).await?;
    assert_eq!(state.status, ProcessStatus::Running, "gate still waiting");

    kernel.complete_task(review_task, Some(json!("lgtm"))).await?;

    let state = kernel.materialize_process_instance(instance).await?;
    info!(?state, "final instance state");
    assert_eq!(state.status, ProcessStatus::Completed);
    assert_eq!(state.steps["convergence"].status, StepStatus::Completed);
    assert_eq!(state.steps["publish"].status, StepStatus::Completed);
    assert!(state.completed_at.is_some());

    let article_state = kernel.materialize(article, ReplayFilter::default()).await?;
    assert_eq!(article_state.status.as_deref(), Some("published"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_fetch_step_and_failed_action_step() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let article_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Article")
                .attributes(vec![attr("title", AttrType::Text, true)])
                .build(),
        )
        .await?;
    let process_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Ingest")
                .kind(GenusKind::Process)
                .lanes(vec![LaneDef {
                    name: "work".to_owned(),
                    position: 0,
                }])
                .steps(vec![
                    StepDef {
                        name: "fetch_title".to_owned(),
                        lane: "work".to_owned(),
                        position: 0,
                        kind: StepKind::FetchStep {
                            fetch_source: "title".to_owned(),
                        },
                    },
                    StepDef {
                        name: "broken".to_owned(),
                        lane: "work".to_owned(),
                        position: 1,
                        kind: StepKind::ActionStep {
                            action_name: "no-such-action".to_owned(),
                            action_resource_bindings: BTreeMap::new(),
                        },
                    },
                    StepDef {
                        name: "fetch_missing".to_owned(),
                        lane: "work".to_owned(),
                        position: 2,
                        kind: StepKind::FetchStep {
                            fetch_source: "absent_attribute".to_owned(),
                        },
                    },
                ])
                .build(),
        )
        .await?;

    let article = kernel
        .create_entity(article_genus, attrs(&[("title", json!("Hello"))]))
        .await?;
    let instance = kernel.start_process(process_genus, Some(article)).await?;

    let state = kernel.materialize_process_instance(instance).await?;
    // Fetch completed with the attribute value; the broken action step
    // failed and was advanced past; the absent fetch still completed.
    assert_eq!(state.steps["fetch_title"].status, StepStatus::Completed);
    assert_eq!(state.steps["fetch_title"].result, Some(json!("Hello")));
    assert_eq!(state.steps["broken"].status, StepStatus::Failed);
    assert!(state.steps["broken"]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("no-such-action")));
    assert_eq!(state.steps["fetch_missing"].status, StepStatus::Completed);
    assert_eq!(state.steps["fetch_missing"].result, Some(Value::Null));
    assert_eq!(state.status, ProcessStatus::Completed);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_cancel_process() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let process_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Chore")
                .kind(GenusKind::Process)
                .lanes(vec![LaneDef {
                    name: "work".to_owned(),
                    position: 0,
                }])
                .steps(vec![StepDef {
                    name: "todo".to_owned(),
                    lane: "work".to_owned(),
                    position: 0,
                    kind: StepKind::TaskStep {
                        task_title: "Do it".to_owned(),
                        priority: None,
                    },
                }])
                .build(),
        )
        .await?;

    let instance = kernel.start_process(process_genus, None).await?;
    kernel.cancel_process(instance, Some("obsolete")).await?;

    let state = kernel.materialize_process_instance(instance).await?;
    assert_eq!(state.status, ProcessStatus::Cancelled);
    assert_eq!(state.cancel_reason.as_deref(), Some("obsolete"));
    assert!(state.completed_at.is_some());

    // The spawned task is untouched at this layer.
    let task = state.steps["todo"].task_id.expect("Task exists");
    let task_state = kernel.materialize(task, ReplayFilter::default()).await?;
    assert_eq!(task_state.status.as_deref(), Some("open"));

    let err = kernel.cancel_process(instance, None).await.unwrap_err();
    assert!(matches!(err, KernelError::NoValidTransition { .. }), "{err}");
    Ok(())
}

// ============================================================================
// Schedules
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_recurring_schedule_fires_once_per_minute() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let heartbeat = kernel
        .define_genus(
            GenusDef::builder()
                .name("heartbeat")
                .kind(GenusKind::Action)
                .handler(vec![SideEffectDef::CreateLog {
                    res: None,
                    message: "tick".to_owned(),
                    severity: None,
                }])
                .build(),
        )
        .await?;
    kernel
        .create_schedule(
            ScheduleDef::builder()
                .name("every-minute")
                .expression("* * * * *")
                .target_type(ScheduleTarget::Action)
                .target_genus_id(heartbeat)
                .build(),
        )
        .await?;

    let t0 = Timestamp::from_millis(1_700_000_040_000);
    let report = kernel.tick_cron(t0).await?;
    assert_eq!(report.checked, 1);
    assert_eq!(report.fired.len(), 1);
    assert!(matches!(
        report.fired[0].outcome,
        TickOutcome::Action(ActionOutcome::Completed { .. })
    ));

    // Same UTC minute: must not fire again.
    let later_same_minute = Timestamp::from_millis(1_700_000_055_000);
    let report = kernel.tick_cron(later_same_minute).await?;
    assert!(report.fired.is_empty());
    assert_eq!(report.skipped, 1);

    // Next minute fires again.
    let next_minute = Timestamp::from_millis(1_700_000_100_000);
    let report = kernel.tick_cron(next_minute).await?;
    assert_eq!(report.fired.len(), 1);

    let (logs, _) = kernel.list_entities(ResId::LOG, ListFilter::default()).await?;
    assert_eq!(
        logs.iter()
            .filter(|l| l.state.attr_str("message") == Some("tick"))
            .count(),
        2
    );
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_one_shot_schedule_retires_after_firing() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let heartbeat = kernel
        .define_genus(
            GenusDef::builder()
                .name("heartbeat")
                .kind(GenusKind::Action)
                .handler(vec![SideEffectDef::CreateLog {
                    res: None,
                    message: "once".to_owned(),
                    severity: None,
                }])
                .build(),
        )
        .await?;
    let schedule = kernel
        .create_schedule(
            ScheduleDef::builder()
                .name("later")
                .scheduled_at(Timestamp::from_millis(120_000))
                .target_type(ScheduleTarget::Action)
                .target_genus_id(heartbeat)
                .build(),
        )
        .await?;

    // Before the trigger time: nothing fires.
    let report = kernel.tick_cron(Timestamp::from_millis(60_000)).await?;
    assert!(report.fired.is_empty());
    assert_eq!(report.skipped, 1);

    let report = kernel.tick_cron(Timestamp::from_millis(120_000)).await?;
    assert_eq!(report.fired.len(), 1);

    let state = kernel.materialize(schedule, ReplayFilter::default()).await?;
    assert_eq!(state.status.as_deref(), Some("retired"));

    // Retired schedules are no longer checked.
    let report = kernel.tick_cron(Timestamp::from_millis(180_000)).await?;
    assert_eq!(report.checked, 0);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_schedule_validation() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let heartbeat = kernel
        .define_genus(
            GenusDef::builder()
                .name("heartbeat")
                .kind(GenusKind::Action)
                .handler(vec![SideEffectDef::CreateLog {
                    res: None,
                    message: "tick".to_owned(),
                    severity: None,
                }])
                .build(),
        )
        .await?;

    let err = kernel
        .create_schedule(
            ScheduleDef::builder()
                .name("broken")
                .expression("61 * * * *")
                .target_type(ScheduleTarget::Action)
                .target_genus_id(heartbeat)
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidCronExpression { .. }), "{err}");

    kernel
        .create_schedule(
            ScheduleDef::builder()
                .name("hourly")
                .expression("@hourly")
                .target_type(ScheduleTarget::Action)
                .target_genus_id(heartbeat)
                .build(),
        )
        .await?;
    let err = kernel
        .create_schedule(
            ScheduleDef::builder()
                .name("hourly")
                .expression("@daily")
                .target_type(ScheduleTarget::Action)
                .target_genus_id(heartbeat)
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::DuplicateName { .. }), "{err}");
    Ok(())
}

// ============================================================================
// Serialization
// ============================================================================

fn article_export_genus() -> GenusDef {
    GenusDef::builder()
        .name("article-export")
        .kind(GenusKind::Serialization)
        .input(SerializationInputDef {
            query_type: QueryType::ByGenus,
            genus_name: Some("Article".to_owned()),
        })
        .output(SerializationOutputDef {
            format: "markdown".to_owned(),
            output_shape: "articles".to_owned(),
        })
        .tree(vec![TreeNodeDef::File {
            name: "article.md".to_owned(),
            template: "---\ntitle: {{entity.title}}\nbody: {{entity.body}}\nstatus: {{entity.status}}\n---\n# {{entity.title}}\n"
                .to_owned(),
        }])
        .build()
}

fn edit_file(tree: &mut FiletreeNode, dir: &str, file: &str, content: &str) {
    let dir_node = tree
        .children
        .as_mut()
        .and_then(|c| c.iter_mut().find(|n| n.name == dir))
        .expect("Directory exists");
    let file_node = dir_node
        .children
        .as_mut()
        .and_then(|c| c.iter_mut().find(|n| n.name == file))
        .expect("File exists");
    file_node.content = Some(content.to_owned());
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_serialization_export_import_roundtrip() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let article_genus = kernel
        .define_genus(
            GenusDef::builder()
                .name("Article")
                .attributes(vec![
                    attr("title", AttrType::Text, true),
                    attr("body", AttrType::Text, false),
                ])
                .states(vec![state("draft", true), state("published", false)])
                .transitions(vec![trans("draft", "published")])
                .build(),
        )
        .await?;
    let export_genus = kernel
        .define_serialization_genus(article_export_genus())
        .await?;

    let article = kernel
        .create_entity(
            article_genus,
            attrs(&[("title", json!("Emerald")), ("body", json!("green stone"))]),
        )
        .await?;

    let run = kernel.run_serialization(export_genus, None).await?;
    assert_eq!(run.entity_ids, vec![article]);
    assert_eq!(run.tree.name, "articles");
    assert!(run.tree.child("_manifest.json").is_some());

    // Unchanged import: zero delta tessellae.
    let report = kernel.import_filetree(&run.tree).await?;
    assert!(report.applied.is_empty(), "{:?}", report.applied);
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);

    // Change one attribute: exactly one attribute_set for that key.
    let mut edited = run.tree.clone();
    edit_file(
        &mut edited,
        &article.to_string(),
        "article.md",
        "---\ntitle: Emerald\nbody: polished stone\nstatus: draft\n---\n# Emerald\n",
    );
    let report = kernel.import_filetree(&edited).await?;
    assert_eq!(report.applied.len(), 1);
    assert_eq!(report.applied[0].kind, "attribute_set");
    assert_eq!(report.applied[0].data["key"], json!("body"));

    let state = kernel.materialize(article, ReplayFilter::default()).await?;
    assert_eq!(state.attr_str("body"), Some("polished stone"));

    // Status is read-only in frontmatter.
    let mut edited = run.tree.clone();
    edit_file(
        &mut edited,
        &article.to_string(),
        "article.md",
        "---\ntitle: Emerald\nbody: polished stone\nstatus: published\n---\n# Emerald\n",
    );
    let report = kernel.import_filetree(&edited).await?;
    assert!(report.applied.is_empty());
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].message.contains("transition_status"));
    let state = kernel.materialize(article, ReplayFilter::default()).await?;
    assert_eq!(state.status.as_deref(), Some("draft"));
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_filetree_os_roundtrip() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let dir = tempdir()?;

    let tree = FiletreeNode::directory(
        "export",
        vec![
            FiletreeNode::directory(
                "inner",
                vec![FiletreeNode::file("notes.md", "Smaragda — σμάραγδος\n")],
            ),
            FiletreeNode::file("readme.txt", "plain ascii\n"),
        ],
    );

    kernel.write_filetree(&tree, dir.path()).await?;
    let read_back = kernel.read_filetree(dir.path().join("export")).await?;
    assert_eq!(read_back, tree);
    Ok(())
}

// ============================================================================
// Sync
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_sync_push_pull() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;

    // Everything so far (bootstrap included) counts as unpushed until
    // marked.
    let head = kernel.head().await?;
    kernel.mark_pushed(head).await?;
    assert!(kernel.get_unpushed_tessellae().await?.is_empty());

    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    let unpushed = kernel.get_unpushed_tessellae().await?;
    assert!(!unpushed.is_empty());
    assert!(unpushed.iter().all(|t| t.res_id == server));

    let res_rows = kernel.get_unpushed_res(&unpushed).await?;
    assert_eq!(res_rows.len(), 1);
    assert_eq!(res_rows[0].0, server);

    // Pull a res and its stream from a peer.
    let remote_res = ResId::generate();
    let payload = SyncPullPayload {
        res: vec![SyncResRow {
            id: remote_res,
            genus_id: genus,
            branch_id: "main".to_owned(),
            created_at: Timestamp::from_millis(1_000),
        }],
        tessellae: vec![
            SyncTessellaRow {
                id: 10,
                res_id: remote_res,
                branch_id: "main".to_owned(),
                kind: "created".to_owned(),
                data: json!({}),
                created_at: Timestamp::from_millis(1_000),
                source: None,
            },
            SyncTessellaRow {
                id: 11,
                res_id: remote_res,
                branch_id: "main".to_owned(),
                kind: "attribute_set".to_owned(),
                data: json!({"key": "ip_address", "value": "10.0.0.99"}),
                created_at: Timestamp::from_millis(2_000),
                source: Some("user:bob".to_owned()),
            },
        ],
        high_water_mark: 11,
    };
    let (res_inserted, tessellae_inserted) =
        kernel.insert_pulled_data(payload, "sync:peer1").await?;
    assert_eq!((res_inserted, tessellae_inserted), (1, 2));

    let state = kernel.materialize(remote_res, ReplayFilter::default()).await?;
    assert_eq!(state.attr_str("ip_address"), Some("10.0.0.99"));

    // Pulled tessellae never show up as unpushed.
    let unpushed = kernel.get_unpushed_tessellae().await?;
    assert!(unpushed.iter().all(|t| t.res_id == server));

    assert_eq!(
        kernel.get_sync_state("last_pulled_sync:peer1").await?,
        Some("11".to_owned())
    );
    Ok(())
}

// ============================================================================
// Misc
// ============================================================================

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_temporal_anchor() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;
    let genus = kernel.define_genus(server_genus()).await?;
    let server = kernel
        .create_entity(genus, attrs(&[("ip_address", json!("10.0.0.1"))]))
        .await?;

    kernel
        .set_temporal_anchor(
            server,
            crate::TemporalAnchorRecord {
                start_year: 1999,
                end_year: Some(2004),
                precision: "year".to_owned(),
                calendar_note: None,
            },
        )
        .await?;

    let anchor = kernel.get_temporal_anchor(server).await?.expect("Anchor set");
    assert_eq!(anchor.start_year, 1999);
    assert_eq!(anchor.end_year, Some(2004));

    // The change is also in the log.
    let log = kernel
        .replay(
            server,
            ReplayFilter {
                kinds: Some(vec!["temporal_anchor_set".to_owned()]),
                ..ReplayFilter::default()
            },
        )
        .await?;
    assert_eq!(log.len(), 1);
    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_archive_hides_from_listing_and_palace_rebuild() -> BoxedErrorResult<()> {
    let (_dir, kernel) = temp_kernel().await?;

    let room = kernel
        .create_entity(
            ResId::PALACE_ROOM,
            attrs(&[("name", json!("Atrium"))]),
        )
        .await?;
    kernel
        .palace_index_upsert(ResId::PALACE_ROOM, room, "Atrium")
        .await?;

    let vault = kernel
        .create_entity(ResId::PALACE_ROOM, attrs(&[("name", json!("Vault"))]))
        .await?;
    kernel
        .palace_index_upsert(ResId::PALACE_ROOM, vault, "Vault")
        .await?;

    kernel.archive_entity(vault).await?;

    // A merge rebuild drops archived rooms and keeps live ones.
    kernel.create_branch("scratch", None).await?;
    kernel.switch_branch("scratch").await?;
    kernel
        .set_attribute(room, "description", json!("marble floors"))
        .await?;
    let outcome = kernel.merge_branch("scratch", None, false).await?;
    assert!(outcome.is_merged());

    assert!(kernel
        .palace_index_get(ResId::PALACE_ROOM, room)
        .await?
        .is_some());
    assert!(kernel
        .palace_index_get(ResId::PALACE_ROOM, vault)
        .await?
        .is_none());

    // Archived entities stay out of listings unless asked for.
    let (listed, _) = kernel
        .list_entities(ResId::PALACE_ROOM, ListFilter::default())
        .await?;
    assert!(listed.iter().all(|l| l.res_id != vault));
    let (listed, _) = kernel
        .list_entities(
            ResId::PALACE_ROOM,
            ListFilter {
                include_archived: true,
                ..ListFilter::default()
            },
        )
        .await?;
    assert!(listed.iter().any(|l| l.res_id == vault));
    Ok(())
}
