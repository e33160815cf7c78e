//! End-to-end tests of the reconciliation engine, driven through a fake
//! watch source: filesystem setup is real, event delivery is synthetic.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{dir_idx, event, rename_event, FakeRegistry, FakeSource, TreeFixture};
use zonewatch::{
    DirectoryZone, FileAction, Filter, Monitor, ResultKind, SourceEvent, WatchedResult,
};

fn fake_monitor() -> (Monitor, Rc<RefCell<FakeRegistry>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (source, registry) = FakeSource::new();
    (Monitor::new(Box::new(source), 1_000_000, 1_000_000, false), registry)
}

fn assert_actions(result: &WatchedResult, expected: &[FileAction]) {
    let actions: Vec<FileAction> = result.actions.iter().map(|a| a.action).collect();
    assert_eq!(actions, expected, "for {}", result.path());
}

/// Every node's ancestor chain must be materialized and no two nodes may
/// share a path.
fn assert_forest_invariants(monitor: &Monitor) {
    let dirs = monitor.dirs();
    for dir in dirs {
        let mut path = dir.path().to_string();
        while let Some(pos) = path.rfind('/') {
            path.truncate(if pos == 0 { 1 } else { pos });
            assert!(
                dirs.iter().any(|d| d.path() == path),
                "missing ancestor {path}"
            );
            if path == "/" {
                break;
            }
        }
    }
    for (i, dir) in dirs.iter().enumerate() {
        assert!(
            !dirs[i + 1..].iter().any(|d| d.path() == dir.path()),
            "duplicate node for {}",
            dir.path()
        );
    }
}

#[test]
fn it_should_build_the_forest_for_two_overlapping_zones() {
    let tree = TreeFixture::new();
    tree.create_file("A1/B11/xx11.txt");
    tree.create_file("A1/B12/C121/xx121.txt");
    tree.create_file("A1/B12/C122/xx122.txt");
    tree.create_file("A1/B12/C123/xx123.txt");
    tree.create_file("A2/B21/C211/xx211.txt");

    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 1)).unwrap();
    assert!(monitor.has_zone(tree.base()));

    let mut inner = DirectoryZone::new(tree.path("A1/B12"), 1);
    inner.subdir_include_filters.push(Filter::exact("C123"));
    monitor.add_zone(inner).unwrap();

    monitor.calc_to_watch_directories().unwrap();
    assert_forest_invariants(&monitor);

    // Ancestors up to "/", the two zone bases, A1, A2 and the one
    // include-filtered subdirectory.
    let base_components = tree.base().split('/').filter(|s| !s.is_empty()).count();
    assert_eq!(monitor.dirs().len(), base_components + 1 + 4);
    for rel in ["A1", "A2", "A1/B12", "A1/B12/C123"] {
        assert!(dir_idx(&monitor, &tree.path(rel)) >= 0, "missing {rel}");
    }
    assert!(dir_idx(&monitor, &tree.path("A1/B12/C121")) < 0);

    let root_idx = monitor.root_dir_idx();
    assert!(root_idx >= 0);
    assert_eq!(monitor.dirs()[root_idx as usize].path(), "/");

    // The chain towards the deeper zone base is pinned past the filters.
    let base = &monitor.dirs()[dir_idx(&monitor, tree.base()) as usize];
    assert_eq!(base.pinned(true), ["A1"]);
}

#[test]
fn it_should_report_only_unfiltered_changes() {
    let tree = TreeFixture::new();
    tree.create_file("A1/B12/C121/xx121.txt");
    tree.create_file("A1/B12/C123/xx123.txt");
    tree.create_file("A2/B21/C211/xx211.txt");

    let (mut monitor, registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 1)).unwrap();
    let mut inner = DirectoryZone::new(tree.path("A1/B12"), 1);
    inner.subdir_include_filters.push(Filter::exact("C123"));
    monitor.add_zone(inner).unwrap();

    let emitted = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&emitted);
    monitor.set_result_handler(move |result| {
        sink.borrow_mut().push((result.path(), result.kind));
    });

    monitor.start().unwrap();
    assert!(monitor.is_watching());

    // C121 and C211 are not watched, so the kernel never reports their
    // files; only the events a real session would deliver are fed in.
    let c123 = dir_idx(&monitor, &tree.path("A1/B12/C123"));
    let a2 = dir_idx(&monitor, &tree.path("A2"));
    assert!(c123 >= 0 && a2 >= 0);
    {
        let registry = registry.borrow();
        let watched = registry.watched_tags();
        assert!(watched.contains(&c123) && watched.contains(&a2));
        for tag in watched {
            assert!((tag as usize) < monitor.dirs().len());
        }
    }

    monitor.handle_event(&event(c123, "xx123.txt", false, FileAction::Modify));
    monitor.handle_event(&event(a2, "xx2.txt", false, FileAction::Create));
    monitor.handle_event(&event(a2, "xx2.txt", false, FileAction::Delete));
    monitor.stop();
    assert!(!monitor.is_watching());
    assert_eq!(registry.borrow().cleared, 1);

    let results = monitor.results();
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].name, "xx123.txt");
    assert_eq!(results[0].kind, ResultKind::Modified);
    assert!(!results[0].inconsistent);
    assert_actions(&results[0], &[FileAction::Modify]);

    assert_eq!(results[1].name, "xx2.txt");
    assert_eq!(results[1].kind, ResultKind::Temporary);
    assert_actions(&results[1], &[FileAction::Create, FileAction::Delete]);

    assert!(!monitor.has_inconsistencies());
    assert_eq!(emitted.borrow().len(), 3);
    assert!(monitor.duration_usec() > 0);
}

#[test]
fn it_should_watch_a_zone_base_that_appears_later() {
    let tree = TreeFixture::new();
    tree.create_dir("A1");

    let (mut monitor, registry) = fake_monitor();
    monitor
        .add_zone(DirectoryZone::new(tree.path("A1/B12"), 1))
        .unwrap();
    monitor.start().unwrap();

    let a1 = dir_idx(&monitor, &tree.path("A1"));
    let b12 = dir_idx(&monitor, &tree.path("A1/B12"));
    assert!(a1 >= 0 && b12 >= 0);
    // The base does not exist yet: its gap-filler parent is watched on
    // its behalf, the base itself cannot be.
    assert!(!monitor.dirs()[b12 as usize].exists());
    assert!(!monitor.dirs()[b12 as usize].is_watched());
    assert!(registry.borrow().watched_tags().contains(&a1));

    // The whole subtree appears before the create event is processed,
    // exactly like a burst of mkdirs outruns watch installation.
    tree.create_file("A1/B12/C123/xx.txt");
    monitor.handle_event(&event(a1, "B12", true, FileAction::Create));
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].name, "B12");
    assert!(results[0].is_dir);
    assert_eq!(results[0].kind, ResultKind::Created);
    assert_eq!(results[1].name, "C123");
    assert!(results[1].is_dir);
    assert_eq!(results[1].kind, ResultKind::Created);
    assert!(results[1].actions[0].immediate);
    assert_eq!(results[2].name, "xx.txt");
    assert!(!results[2].is_dir);
    assert_eq!(results[2].kind, ResultKind::Created);
    assert!(results[2].actions[0].immediate);
    assert!(!monitor.has_inconsistencies());

    // The model gained watches on the newly created directories.
    let c123 = dir_idx(&monitor, &tree.path("A1/B12/C123"));
    assert!(c123 >= 0);
    assert!(monitor.dirs()[b12 as usize].is_watched());
    assert!(monitor.dirs()[c123 as usize].is_watched());
    let registry = registry.borrow();
    assert!(registry
        .added
        .iter()
        .any(|(path, tag)| path == &tree.path("A1/B12") && *tag == b12));
}

#[test]
fn it_should_flag_a_missed_directory_delete() {
    let tree = TreeFixture::new();
    tree.create_file("A/B/xx1.txt");

    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();

    let a = dir_idx(&monitor, &tree.path("A"));
    let ab = dir_idx(&monitor, &tree.path("A/B"));
    assert!(a >= 0 && ab >= 0);

    tree.remove_file("A/B/xx1.txt");
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Delete));

    tree.remove_dir("A/B");
    // The delete event for B itself goes missing.
    tree.create_dir("A/B");
    monitor.handle_event(&event(a, "B", true, FileAction::Create));
    monitor.stop();

    assert!(monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].name, "xx1.txt");
    assert!(!results[0].is_dir);
    assert_eq!(results[0].kind, ResultKind::Deleted);
    assert!(!results[0].inconsistent);
    assert_actions(&results[0], &[FileAction::Delete]);

    assert_eq!(results[1].name, "B");
    assert!(results[1].is_dir);
    assert_eq!(results[1].kind, ResultKind::Modified);
    assert!(results[1].inconsistent);
    assert_actions(&results[1], &[FileAction::Create]);
}

#[test]
fn it_should_flag_impossible_transitions() {
    let tree = TreeFixture::new();
    tree.create_file("A/B/xx1.txt");

    // Create of an entry that still has a result marked existing.
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();
    let ab = dir_idx(&monitor, &tree.path("A/B"));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Modify));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Create));
    monitor.stop();
    assert!(monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, ResultKind::Modified);
    assert!(results[0].inconsistent);
    assert_actions(&results[0], &[FileAction::Modify, FileAction::Create]);

    // Delete of an already deleted entry.
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();
    let ab = dir_idx(&monitor, &tree.path("A/B"));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Delete));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Delete));
    monitor.stop();
    assert!(monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results[0].kind, ResultKind::Deleted);
    assert!(results[0].inconsistent);

    // Modify of an already deleted entry.
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();
    let ab = dir_idx(&monitor, &tree.path("A/B"));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Delete));
    monitor.handle_event(&event(ab, "xx1.txt", false, FileAction::Modify));
    monitor.stop();
    assert!(monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results[0].kind, ResultKind::Modified);
    assert!(results[0].inconsistent);
    assert_actions(&results[0], &[FileAction::Delete, FileAction::Modify]);
}

#[test]
fn it_should_survive_deep_recreation_without_inconsistencies() {
    let tree = TreeFixture::new();
    let (mut monitor, _registry) = fake_monitor();
    monitor
        .add_zone(DirectoryZone::new(tree.base(), 9999))
        .unwrap();
    monitor.start().unwrap();
    let base = dir_idx(&monitor, tree.base());

    // Phase 1: the tree appears; only the topmost create is a kernel
    // event, everything deeper is found by the immediate scan.
    tree.create_file("D1/D2/D3/xx.txt");
    monitor.handle_event(&event(base, "D1", true, FileAction::Create));

    let d1 = dir_idx(&monitor, &tree.path("D1"));
    let d2 = dir_idx(&monitor, &tree.path("D1/D2"));
    let d3 = dir_idx(&monitor, &tree.path("D1/D2/D3"));
    assert!(d1 >= 0 && d2 >= 0 && d3 >= 0);

    // Phase 2: everything is torn down, bottom up.
    tree.remove_file("D1/D2/D3/xx.txt");
    monitor.handle_event(&event(d3, "xx.txt", false, FileAction::Delete));
    tree.remove_dir("D1/D2/D3");
    monitor.handle_event(&event(d2, "D3", true, FileAction::Delete));
    tree.remove_dir("D1/D2");
    monitor.handle_event(&event(d1, "D2", true, FileAction::Delete));
    tree.remove_dir("D1");
    monitor.handle_event(&event(base, "D1", true, FileAction::Delete));

    // Phase 3: the identical tree reappears.
    tree.create_file("D1/D2/D3/xx.txt");
    monitor.handle_event(&event(base, "D1", true, FileAction::Create));
    monitor.stop();

    assert!(!monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results.len(), 4);
    for result in results {
        assert_eq!(result.kind, ResultKind::Created, "for {}", result.path());
        assert!(!result.inconsistent);
        assert_actions(
            result,
            &[FileAction::Create, FileAction::Delete, FileAction::Create],
        );
    }
}

#[test]
fn it_should_transfer_watches_across_a_rename_round_trip() {
    let tree = TreeFixture::new();
    tree.create_file("A1/B12/xx.txt");

    let (mut monitor, registry) = fake_monitor();
    monitor
        .add_zone(DirectoryZone::new(tree.base(), 9999))
        .unwrap();
    monitor.start().unwrap();

    let base = dir_idx(&monitor, tree.base());
    let a1 = dir_idx(&monitor, &tree.path("A1"));
    let b12 = dir_idx(&monitor, &tree.path("A1/B12"));
    let watched_before = {
        let mut tags = registry.borrow().watched_tags();
        tags.sort_unstable();
        tags
    };

    tree.rename("A1", "A2");
    monitor.handle_event(&rename_event(base, "A1", true, FileAction::RenameFrom, 71));
    monitor.handle_event(&rename_event(base, "A2", true, FileAction::RenameTo, 71));

    // The kernel watches moved with their inodes: same slots, new tags.
    let a2 = dir_idx(&monitor, &tree.path("A2"));
    let a2_b12 = dir_idx(&monitor, &tree.path("A2/B12"));
    assert!(a2 >= 0 && a2_b12 >= 0);
    assert!(monitor.dirs()[a2 as usize].is_watched());
    assert!(monitor.dirs()[a2_b12 as usize].is_watched());
    assert!(!monitor.dirs()[a1 as usize].exists());
    assert!(!monitor.dirs()[a1 as usize].is_watched());

    tree.rename("A2", "A1");
    monitor.handle_event(&rename_event(base, "A2", true, FileAction::RenameFrom, 72));
    monitor.handle_event(&rename_event(base, "A1", true, FileAction::RenameTo, 72));
    monitor.stop();

    assert!(!monitor.has_inconsistencies());
    let results = monitor.results();
    assert_eq!(results.len(), 6);

    let by_path = |path: &str| -> &WatchedResult {
        results
            .iter()
            .find(|r| r.path() == path)
            .unwrap_or_else(|| panic!("no result for {path}"))
    };

    for rel in ["A1", "A1/B12", "A1/B12/xx.txt"] {
        let result = by_path(&tree.path(rel));
        assert_eq!(result.kind, ResultKind::Modified, "for {rel}");
        assert_actions(result, &[FileAction::RenameFrom, FileAction::RenameTo]);
        assert!(!result.actions[0].other_path.is_empty());
    }
    for rel in ["A2", "A2/B12", "A2/B12/xx.txt"] {
        let result = by_path(&tree.path(rel));
        assert_eq!(result.kind, ResultKind::Temporary, "for {rel}");
        assert_actions(result, &[FileAction::RenameTo, FileAction::RenameFrom]);
    }

    // Round trip: the watched set is back where it started (history
    // nodes for A2 exist but hold no watch).
    let watched_after = {
        let mut tags = registry.borrow().watched_tags();
        tags.sort_unstable();
        tags
    };
    assert_eq!(watched_before, watched_after);
    assert!(watched_after.contains(&a1) && watched_after.contains(&b12));
}

#[test]
fn it_should_conclude_an_unpaired_move_as_gone() {
    let tree = TreeFixture::new();
    tree.create_file("A1/B12/xx.txt");
    let target = TreeFixture::new();

    let (mut monitor, registry) = fake_monitor();
    monitor
        .add_zone(DirectoryZone::new(tree.base(), 9999))
        .unwrap();
    monitor.start().unwrap();

    let base = dir_idx(&monitor, tree.base());
    let a1 = dir_idx(&monitor, &tree.path("A1"));
    let b12 = dir_idx(&monitor, &tree.path("A1/B12"));

    // The destination lies outside every zone, so no RenameTo ever comes.
    std::fs::rename(tree.path("A1"), target.path("A1")).unwrap();
    monitor.handle_event(&rename_event(base, "A1", true, FileAction::RenameFrom, 5));
    assert!(monitor.results().is_empty());

    std::thread::sleep(std::time::Duration::from_millis(2));
    monitor.check_open_moves();
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 3);
    for result in results {
        assert_eq!(result.kind, ResultKind::Deleted, "for {}", result.path());
        assert_actions(result, &[FileAction::RenameFrom]);
        assert!(result.actions[0].other_path.is_empty());
    }
    let watched = registry.borrow().watched_tags();
    assert!(!watched.contains(&a1));
    assert!(!watched.contains(&b12));
}

#[test]
fn it_should_scan_a_directory_that_arrives_from_outside() {
    let tree = TreeFixture::new();
    let outside = TreeFixture::new();
    outside.create_file("NEW/inner/xx.txt");

    let (mut monitor, _registry) = fake_monitor();
    monitor
        .add_zone(DirectoryZone::new(tree.base(), 9999))
        .unwrap();
    monitor.start().unwrap();
    let base = dir_idx(&monitor, tree.base());

    std::fs::rename(outside.path("NEW"), tree.path("NEW")).unwrap();
    monitor.handle_event(&rename_event(base, "NEW", true, FileAction::RenameTo, 9));
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].name, "NEW");
    assert_eq!(results[0].kind, ResultKind::Created);
    assert_actions(&results[0], &[FileAction::RenameTo]);
    // The contents were discovered by scanning the new watch.
    for result in &results[1..] {
        assert_eq!(result.kind, ResultKind::Created);
        assert!(result.actions[0].immediate);
    }
}

#[test]
fn it_should_keep_a_single_result_for_the_root_directory() {
    let tree = TreeFixture::new();
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 1)).unwrap();
    monitor.start().unwrap();

    let root = monitor.root_dir_idx();
    let self_attrib = SourceEvent {
        tag: root,
        action: FileAction::Attrib,
        is_dir: true,
        ..SourceEvent::default()
    };
    monitor.handle_event(&self_attrib);
    monitor.handle_event(&self_attrib);

    // Self-events on any other watched directory are ignored; the parent
    // covers them.
    let base = dir_idx(&monitor, tree.base());
    monitor.handle_event(&SourceEvent {
        tag: base,
        action: FileAction::Attrib,
        is_dir: true,
        ..SourceEvent::default()
    });
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].parent_path, "/");
    assert_eq!(results[0].name, "");
    assert_eq!(results[0].kind, ResultKind::Modified);
    assert_actions(&results[0], &[FileAction::Attrib]);
}

#[test]
fn it_should_upgrade_attrib_on_an_unseen_entry_to_create() {
    let tree = TreeFixture::new();
    tree.create_dir("A");

    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();
    let a = dir_idx(&monitor, &tree.path("A"));

    // A chmod made a file visible that the scan could not see before.
    tree.create_file("A/hidden.txt");
    monitor.handle_event(&event(a, "hidden.txt", false, FileAction::Attrib));
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].kind, ResultKind::Created);
    assert_actions(&results[0], &[FileAction::Create]);
    assert!(results[0].actions[0].caused_by_attrib);
    assert!(!results[0].inconsistent);
}

#[test]
fn it_should_fold_the_kernel_create_into_an_immediate_one() {
    let tree = TreeFixture::new();
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 9999)).unwrap();
    monitor.start().unwrap();
    let base = dir_idx(&monitor, tree.base());

    // D appears with a file already inside; the scan reports the file
    // first, then the kernel's own create for it arrives.
    tree.create_file("D/late.txt");
    monitor.handle_event(&event(base, "D", true, FileAction::Create));
    let d = dir_idx(&monitor, &tree.path("D"));
    monitor.handle_event(&event(d, "late.txt", false, FileAction::Create));
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 2);
    let late = &results[1];
    assert_eq!(late.name, "late.txt");
    assert_eq!(late.kind, ResultKind::Created);
    // One action only, no longer flagged immediate, not inconsistent.
    assert_actions(late, &[FileAction::Create]);
    assert!(!late.actions[0].immediate);
    assert!(!late.inconsistent);
}

#[test]
fn it_should_surface_a_queue_overflow() {
    let tree = TreeFixture::new();
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 1)).unwrap();
    monitor.start().unwrap();
    assert!(!monitor.has_queue_overflown());
    monitor.handle_event(&SourceEvent {
        overflow: true,
        ..SourceEvent::default()
    });
    monitor.stop();
    assert!(monitor.has_queue_overflown());
}

#[test]
fn it_should_validate_zone_declarations() {
    let (mut monitor, _registry) = fake_monitor();

    // A monitor whose source reports the kernel's unwatchable prefixes;
    // the set is sampled at construction time.
    let mut forbidden_monitor = {
        let (source, registry) = FakeSource::new();
        registry.borrow_mut().invalid_paths =
            vec!["/proc".to_string(), "/sys".to_string(), "/dev/pts".to_string()];
        Monitor::new(Box::new(source), 1000, 1000, false)
    };

    assert!(monitor.add_zone(DirectoryZone::new("relative/path", 1)).is_err());
    assert!(monitor.add_zone(DirectoryZone::new("/nonexistent/a/../b", 1)).is_err());
    assert!(monitor
        .add_zone(DirectoryZone::new("/nonexistent/a", -1))
        .is_err());

    let mut bad_pin = DirectoryZone::new("/nonexistent/a", 1);
    bad_pin.pinned_files.push("dir/file".to_string());
    assert!(monitor.add_zone(bad_pin).is_err());

    let mut bad_regex = DirectoryZone::new("/nonexistent/a", 1);
    bad_regex.file_include_filters.push(Filter::regex("("));
    assert!(monitor.add_zone(bad_regex).is_err());

    assert!(forbidden_monitor
        .add_zone(DirectoryZone::new("/proc/sys/fs", 1))
        .is_err());
    // An ancestor of a forbidden prefix is allowed; its unwatchable
    // descendants just never materialize.
    assert!(forbidden_monitor.add_zone(DirectoryZone::new("/", 0)).is_ok());

    // Duplicate base, then a clean round trip back to the start state.
    monitor.add_zone(DirectoryZone::new("/nonexistent/a", 2)).unwrap();
    assert!(monitor.add_zone(DirectoryZone::new("/nonexistent/a", 5)).is_err());
    assert_eq!(monitor.zones().len(), 1);
    monitor.remove_zone("/nonexistent/a").unwrap();
    assert!(monitor.zones().is_empty());
    assert!(monitor.remove_zone("/nonexistent/a").is_err());
}

#[test]
fn it_should_manage_single_file_watches() {
    let tree = TreeFixture::new();
    tree.create_file("conf/app.conf");

    let (mut monitor, _registry) = fake_monitor();
    let conf_path = tree.path("conf/app.conf");
    monitor.add_file(&conf_path).unwrap();
    assert!(monitor.has_file(&conf_path));
    assert!(monitor.add_file(&conf_path).is_err());
    assert_eq!(monitor.files(), [conf_path.clone()]);

    monitor.calc_to_watch_directories().unwrap();
    // The parent directory is tracked even without any zone, with the
    // file pinned past the (absent) filters.
    let conf_dir = dir_idx(&monitor, &tree.path("conf"));
    assert!(conf_dir >= 0);
    let node = &monitor.dirs()[conf_dir as usize];
    assert!(node.owner_zone() < 0);
    assert_eq!(node.pinned(false), ["app.conf"]);

    monitor.start().unwrap();
    let conf_dir = dir_idx(&monitor, &tree.path("conf"));
    monitor.handle_event(&event(conf_dir, "app.conf", false, FileAction::Modify));
    // A sibling in the same gap-filler directory is not watched.
    monitor.handle_event(&event(conf_dir, "other.txt", false, FileAction::Modify));
    monitor.stop();

    let results = monitor.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].name, "app.conf");
    assert_eq!(results[0].kind, ResultKind::Modified);

    monitor.remove_file(&conf_path).unwrap();
    assert!(monitor.files().is_empty());
    assert!(monitor.remove_file(&conf_path).is_err());
}

#[test]
fn it_should_recalculate_idempotently() {
    let tree = TreeFixture::new();
    tree.create_file("A/B/xx.txt");

    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 5)).unwrap();
    monitor.calc_to_watch_directories().unwrap();
    let first: Vec<String> = monitor.dirs().iter().map(|d| d.path().to_string()).collect();
    monitor.calc_to_watch_directories().unwrap();
    let second: Vec<String> = monitor.dirs().iter().map(|d| d.path().to_string()).collect();
    assert_eq!(first, second);
    assert_forest_invariants(&monitor);
}

#[test]
fn it_should_reject_declarations_and_recalculation_while_watching() {
    let tree = TreeFixture::new();
    let (mut monitor, _registry) = fake_monitor();
    monitor.add_zone(DirectoryZone::new(tree.base(), 1)).unwrap();
    monitor.start().unwrap();
    assert!(monitor.start().is_err());
    assert!(monitor.add_zone(DirectoryZone::new("/nonexistent/x", 1)).is_err());
    assert!(monitor.remove_zone(tree.base()).is_err());
    assert!(monitor.add_file("/nonexistent/x.txt").is_err());
    assert!(monitor.calc_to_watch_directories().is_err());
    monitor.stop();
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn it_should_drive_a_real_inotify_session() {
    use std::time::Duration;

    let tree = TreeFixture::new();
    let mut monitor = Monitor::with_inotify(10_000, 10_000).unwrap();
    monitor.add_zone(DirectoryZone::new(tree.base(), 3)).unwrap();
    monitor.start().unwrap();

    let base = tree.base().to_string();
    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        std::fs::write(format!("{base}/xx.txt"), b"zonewatch driver test\n").unwrap();
    });

    // The driver runs until stopped; a timeout bounds the session.
    let _ = tokio::time::timeout(
        Duration::from_millis(400),
        zonewatch::driver::drive(&mut monitor),
    )
    .await;
    writer.join().unwrap();
    monitor.stop();

    assert!(monitor
        .results()
        .iter()
        .any(|r| r.name == "xx.txt" && r.kind == ResultKind::Created));
}

#[test]
fn it_should_abort_when_the_directory_cap_is_hit() {
    let tree = TreeFixture::new();
    tree.create_file("A/B/C/xx.txt");

    let (source, _registry) = FakeSource::new();
    let mut monitor = Monitor::new(Box::new(source), 2, 1000, false);
    monitor.add_zone(DirectoryZone::new(tree.base(), 5)).unwrap();
    let err = monitor.start().unwrap_err();
    assert!(err.contains("limit"), "unexpected error: {err}");
    assert!(!monitor.is_watching());
}
