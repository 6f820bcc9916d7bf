//! Tests for the version tree: branching, tags, replay and persistence.

use vistrail::action::{ActionItem, DataObject, create_action, create_paste_action};
use vistrail::errors::WorkflowError;
use vistrail::ids::{ModuleId, VersionId};
use vistrail::module::{Annotation, IdRemap, Module};
use vistrail::persistence::FileLocator;
use vistrail::registry::basic;
use vistrail::testing::{assert_pipelines_equal_no_id, square_chain};
use vistrail::vistrail::Vistrail;

fn add_module(vt: &mut Vistrail, parent: VersionId, id: u64, name: &str) -> anyhow::Result<VersionId> {
    let action = create_action(vec![ActionItem::add(DataObject::Module(Module::new(
        id,
        basic::PACKAGE,
        name,
    )))])?;
    vt.add_action(action, parent)
}

#[test]
fn test_root_is_empty() -> anyhow::Result<()> {
    let vt = Vistrail::new();
    assert!(vt.get_pipeline(VersionId::ROOT)?.is_empty());
    assert_eq!(vt.latest_version(), VersionId::ROOT);
    Ok(())
}

#[test]
fn test_branches_replay_only_their_own_path() -> anyhow::Result<()> {
    let mut vt = Vistrail::new();
    let v1 = add_module(&mut vt, VersionId::ROOT, 1, "Float")?;
    let v2 = add_module(&mut vt, v1, 2, "String")?;
    let v3 = add_module(&mut vt, v1, 3, "Integer")?;

    let p2 = vt.get_pipeline(v2)?;
    let p3 = vt.get_pipeline(v3)?;
    assert!(p2.module(ModuleId::new(2)).is_some());
    assert!(p2.module(ModuleId::new(3)).is_none());
    assert!(p3.module(ModuleId::new(3)).is_some());
    assert!(p3.module(ModuleId::new(2)).is_none());
    assert_eq!(vt.parent(v2), Some(v1));
    assert_eq!(vt.children(v1), vec![v2, v3]);
    Ok(())
}

#[test]
fn test_get_pipeline_is_idempotent() -> anyhow::Result<()> {
    let (source, _) = square_chain(5)?;
    let mut vt = Vistrail::new();
    let action = create_paste_action(&source, vt.id_scope_mut(), &mut IdRemap::new());
    let v = vt.add_action(action, VersionId::ROOT)?;
    let first = vt.get_pipeline(v)?;
    let second = vt.get_pipeline(v)?;
    assert_eq!(first, second);
    assert_pipelines_equal_no_id(&first, &source);
    Ok(())
}

#[test]
fn test_tags_are_unique_aliases() -> anyhow::Result<()> {
    let mut vt = Vistrail::new();
    let v1 = add_module(&mut vt, VersionId::ROOT, 1, "Float")?;
    let v2 = add_module(&mut vt, v1, 2, "Float")?;
    vt.add_tag(v1, "first")?;
    vt.add_tag(v1, "first")?;
    let err = vt.add_tag(v2, "first").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<WorkflowError>(),
        Some(WorkflowError::Structure(_))
    ));
    assert_eq!(vt.resolve("first")?, v1);
    assert_eq!(vt.get_tag(v1), Some("first"));
    Ok(())
}

#[test]
fn test_unknown_versions_are_not_found() {
    let vt = Vistrail::new();
    for err in [
        vt.get_pipeline(VersionId::new(42)).unwrap_err(),
        vt.get_pipeline("missing").unwrap_err(),
    ] {
        assert!(matches!(
            err.downcast_ref::<WorkflowError>(),
            Some(WorkflowError::NotFound(_))
        ));
    }
}

#[test]
fn test_action_that_does_not_apply_is_rejected() -> anyhow::Result<()> {
    let mut vt = Vistrail::new();
    let bad = create_action(vec![ActionItem::add(DataObject::Annotation {
        module_id: ModuleId::new(5),
        annotation: Annotation::new(1, "k", "v"),
    })])?;
    assert!(vt.add_action(bad, VersionId::ROOT).is_err());
    assert_eq!(vt.latest_version(), VersionId::ROOT);
    Ok(())
}

#[test]
fn test_version_diff_applies_between_siblings() -> anyhow::Result<()> {
    let mut vt = Vistrail::new();
    let v1 = add_module(&mut vt, VersionId::ROOT, 1, "Float")?;
    let v2 = add_module(&mut vt, v1, 2, "String")?;
    let v3 = add_module(&mut vt, v1, 3, "Integer")?;
    let diff = vt.diff(v2, v3)?;
    let mut p = vt.get_pipeline(v2)?;
    diff.apply(&mut p)?;
    assert_eq!(p, vt.get_pipeline(v3)?);
    Ok(())
}

#[test]
fn test_save_and_load_round_trip() -> anyhow::Result<()> {
    let mut vt = Vistrail::new();
    let v1 = add_module(&mut vt, VersionId::ROOT, 1, "Float")?;
    vt.add_tag(v1, "saved")?;

    let dir = tempfile::tempdir()?;
    let locator = FileLocator::new(dir.path().join("history.vt"));
    locator.save(&vt)?;
    let loaded: Vistrail = locator.load()?;

    assert_eq!(loaded.resolve("saved")?, v1);
    assert_eq!(loaded.get_pipeline("saved")?, vt.get_pipeline(v1)?);
    // the loaded scope keeps issuing fresh versions
    let mut loaded = loaded;
    let v2 = add_module(&mut loaded, v1, 2, "Float")?;
    assert!(v2 > v1);
    Ok(())
}
