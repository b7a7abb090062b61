mod support;

use tempfile::TempDir;

use strata_core::catalog::{ExclusionSet, collect_features, collect_units};
use strata_core::error::Error;
use strata_core::types::UnitKind;

use support::touch;

#[test]
fn units_sort_as_plain_strings() {
    let temp = TempDir::new().unwrap();
    touch(&temp.path().join("2-x.script"));
    touch(&temp.path().join("10-x.script"));
    std::fs::create_dir(temp.path().join("05-bundle")).unwrap();

    let catalog = collect_units(temp.path(), &ExclusionSet::default()).unwrap();
    assert_eq!(catalog.ids(), vec!["05-bundle", "10-x", "2-x"]);

    let rescanned = collect_units(temp.path(), &ExclusionSet::default()).unwrap();
    assert_eq!(rescanned.units(), catalog.units());
}

#[test]
fn reserved_hidden_and_foreign_entries_are_skipped() {
    let temp = TempDir::new().unwrap();
    touch(&temp.path().join("setup.script"));
    touch(&temp.path().join(".0000-hidden.script"));
    touch(&temp.path().join("README.md"));
    touch(&temp.path().join("0001-a.script"));

    let catalog = collect_units(temp.path(), &ExclusionSet::default()).unwrap();
    assert_eq!(catalog.ids(), vec!["0001-a"]);
    assert_eq!(catalog.units()[0].kind, UnitKind::ExecutableScript);
    assert_eq!(catalog.hooks_path(), Some(temp.path().join("setup.script")));
}

#[test]
fn bundle_notes_are_read() {
    let temp = TempDir::new().unwrap();
    let bundle = temp.path().join("0001-site");
    std::fs::create_dir(&bundle).unwrap();
    std::fs::write(bundle.join("notes.txt"), "\n  Rebuild the search index  \n").unwrap();
    std::fs::create_dir(temp.path().join("0002-empty-notes")).unwrap();
    std::fs::write(temp.path().join("0002-empty-notes/notes.txt"), "  \n").unwrap();

    let catalog = collect_units(temp.path(), &ExclusionSet::default()).unwrap();
    let site = catalog.get("0001-site").unwrap();
    assert_eq!(site.kind, UnitKind::ArchiveBundle);
    assert_eq!(site.notes.as_deref(), Some("Rebuild the search index"));
    assert_eq!(catalog.get("0002-empty-notes").unwrap().notes, None);
}

#[test]
fn exclusions_drop_matching_entries() {
    let temp = TempDir::new().unwrap();
    touch(&temp.path().join("0001-a.script"));
    touch(&temp.path().join("0002-wip-b.script"));
    std::fs::create_dir(temp.path().join("0003-draft")).unwrap();

    let exclusions = ExclusionSet::new(&["wip", "^0003"]).unwrap();
    let catalog = collect_units(temp.path(), &exclusions).unwrap();
    assert_eq!(catalog.ids(), vec!["0001-a"]);
}

#[test]
fn missing_directory_is_not_found() {
    let temp = TempDir::new().unwrap();
    let err = collect_units(&temp.path().join("absent"), &ExclusionSet::default()).unwrap_err();
    assert!(matches!(err, Error::NotFound { what: "directory", .. }));
}

#[test]
fn duplicate_ids_are_rejected() {
    let temp = TempDir::new().unwrap();
    touch(&temp.path().join("0001-a.script"));
    std::fs::create_dir(temp.path().join("0001-a")).unwrap();

    let err = collect_units(temp.path(), &ExclusionSet::default()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("0001-a"));
}

#[test]
fn features_need_a_descriptor() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("search")).unwrap();
    std::fs::write(temp.path().join("search/feature.toml"), "").unwrap();
    std::fs::create_dir(temp.path().join("scratch")).unwrap();
    touch(&temp.path().join("notes.md"));
    std::fs::create_dir(temp.path().join("reviews")).unwrap();
    std::fs::write(
        temp.path().join("reviews/feature.toml"),
        "name = \"product-reviews\"\n",
    )
    .unwrap();

    let names: Vec<String> = collect_features(temp.path())
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["product-reviews", "search"]);

    let err = collect_features(&temp.path().join("absent")).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn duplicate_feature_names_are_rejected() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("search")).unwrap();
    std::fs::write(temp.path().join("search/feature.toml"), "").unwrap();
    std::fs::create_dir(temp.path().join("search-v2")).unwrap();
    std::fs::write(temp.path().join("search-v2/feature.toml"), "name = \"search\"\n").unwrap();

    let err = collect_features(temp.path()).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(err.to_string().contains("duplicate feature name 'search'"));
}
