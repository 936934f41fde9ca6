//! End-to-end runs of the Maker loop over the local transport: a
//! real launcher script embedding the dispatch server and workers,
//! a real shell "simulation program", real archives.

use std::{cell::RefCell, path::Path, rc::Rc, sync::Arc};

use serde_json::{json, Map};

use hateno::{
    folder::Folder,
    maker::{Maker, RunOutcome},
    simulation::{Request, Simulation, UserSetting},
};

const SKELETON: &str = r#"#!/bin/sh
JOB="@JOB@"
"$JOB" server --command-lines $COMMAND_LINES_FILENAME --log $LOG_FILENAME --port-file $COMMAND_LINES_FILENAME.port > /dev/null &
while [ ! -s $COMMAND_LINES_FILENAME.port ]; do sleep 0.05; done
PORT=$(cat $COMMAND_LINES_FILENAME.port)
### BEGIN_EXEC ###
"$JOB" client --port $PORT &
### END_EXEC ###
wait
"#;

/// The "simulation program": writes `result-<n>.txt` into the folder
/// given on its command line, refusing to produce anything for the
/// value @BROKEN@.
const RUN_SH: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
    case "$1" in
        --n) N="$2"; shift 2 ;;
        --folder) DIR="$2"; shift 2 ;;
        *) shift ;;
    esac
done
if [ "$N" = "@BROKEN@" ]; then
    echo "refusing n=$N" >&2
    exit 1
fi
mkdir -p "$DIR"
echo "result $N" > "$DIR/result-$N.txt"
"#;

struct Fixture {
    root: tempfile::TempDir,
    folder: Arc<Folder>,
}

/// A simulations folder whose compute host is a plain directory on
/// this machine.
fn fixture(maker_config: serde_json::Value) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let conf_dir = root.path().join(".hateno");
    std::fs::create_dir_all(conf_dir.join("config/default")).unwrap();
    std::fs::create_dir_all(conf_dir.join("skeletons")).unwrap();

    let work = root.path().join("host");
    std::fs::create_dir_all(&work).unwrap();

    std::fs::write(
        conf_dir.join("hateno.conf"),
        serde_json::to_string_pretty(&json!({
            "exec": "sh run.sh",
            "setting_pattern": "--{name} {value}",
            "settings": [
                {
                    "set": "main",
                    "required": true,
                    "settings": [
                        {"name": "n", "default": 1},
                        {
                            "name": "folder",
                            "default": "{globalsetting:folder}",
                            "exclude": true
                        }
                    ]
                }
            ],
            "fixers": ["intFloats"],
            "output": {
                "files": [
                    {"name": "result-{setting:n}.txt", "checks": ["exists", "notEmpty"]}
                ]
            },
            "default_config": "default"
        }))
        .unwrap(),
    )
    .unwrap();

    std::fs::write(
        conf_dir.join("config/default/maker.json"),
        serde_json::to_string_pretty(&maker_config).unwrap(),
    )
    .unwrap();
    std::fs::write(
        conf_dir.join("config/default/generator.json"),
        serde_json::to_string_pretty(&json!({
            "skeleton_filename": "launch.skeleton.sh",
            "launch_filename": "launch.sh",
            "log_filename": "log.json",
            "n_exec": 2
        }))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        conf_dir.join("config/default/folder.json"),
        serde_json::to_string_pretty(&json!({
            "working_directory": work.to_string_lossy()
        }))
        .unwrap(),
    )
    .unwrap();

    let skeleton = SKELETON.replace("@JOB@", env!("CARGO_BIN_EXE_simulations-job"));
    std::fs::write(conf_dir.join("skeletons/launch.skeleton.sh"), skeleton).unwrap();
    std::fs::write(work.join("run.sh"), RUN_SH.replace("@BROKEN@", "13")).unwrap();

    let folder = Arc::new(Folder::open(root.path()).unwrap());
    Fixture { root, folder }
}

fn request(fixture: &Fixture, dest: &str, n: i64) -> Request {
    Request {
        folder: fixture.root.path().join(dest),
        settings: vec![UserSetting {
            set: "main".into(),
            set_index: 0,
            name: "n".into(),
            value: json!(n),
        }],
        globals: Map::new(),
    }
}

fn completed(outcome: RunOutcome) -> Vec<Request> {
    match outcome {
        RunOutcome::Completed { unknown } => unknown,
        RunOutcome::Paused => panic!("unexpected pause"),
    }
}

fn catalog_keys(folder: &Folder) -> Vec<String> {
    let path = folder.simulations_list_filename();
    if !path.exists() {
        return vec![];
    }
    let map: std::collections::BTreeMap<String, String> =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    map.into_keys().collect()
}

/// Count how often an event fires during a run.
fn count_event(maker: &mut Maker, event: &str) -> Rc<RefCell<usize>> {
    let counter = Rc::new(RefCell::new(0));
    let c = counter.clone();
    maker
        .add_event_listener(event, move |_| {
            *c.borrow_mut() += 1;
        })
        .unwrap();
    counter
}

#[test]
fn cold_generate_then_cached_extract() {
    let fx = fixture(json!({"max_corrupted": 0, "max_failures": 0}));

    // cold: the catalog is empty, one batch is generated
    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    let generates = count_event(&mut maker, "generate-start");
    let unknown = completed(maker.run(vec![request(&fx, "out/a", 3)]).unwrap());
    assert!(unknown.is_empty());
    assert_eq!(*generates.borrow(), 1);

    let dest = fx.root.path().join("out/a");
    assert_eq!(
        std::fs::read_to_string(dest.join("result-3.txt")).unwrap(),
        "result 3\n"
    );

    // the catalog now holds exactly the request's identity
    let expected = Simulation::new(fx.folder.clone(), request(&fx, "out/a", 3))
        .name()
        .unwrap();
    assert_eq!(catalog_keys(&fx.folder), vec![expected.as_str().to_owned()]);

    // the remote side was cleaned up: work folders and scripts gone
    let host_entries: Vec<_> = std::fs::read_dir(fx.root.path().join("host"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(host_entries, vec!["run.sh".to_string()]);
    drop(maker);

    // cached: a second request with the same settings is served from
    // the archive, no generation step
    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    let generates = count_event(&mut maker, "generate-start");
    let unknown = completed(maker.run(vec![request(&fx, "out/b", 3)]).unwrap());
    assert!(unknown.is_empty());
    assert_eq!(*generates.borrow(), 0);
    assert!(fx.root.path().join("out/b/result-3.txt").is_file());
}

#[test]
fn partial_failure_exhausts_corruption_budget() {
    // n=13 makes the program fail; allow one corrupted iteration so
    // the loop retries once before giving up
    let fx = fixture(json!({"max_corrupted": 1, "max_failures": 5}));

    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    let generates = count_event(&mut maker, "generate-start");
    let requests = vec![request(&fx, "out/good", 4), request(&fx, "out/bad", 13)];
    let unknown = completed(maker.run(requests).unwrap());

    // the good simulation made it, the broken one is reported back
    assert!(fx.root.path().join("out/good/result-4.txt").is_file());
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].folder, fx.root.path().join("out/bad"));
    assert_eq!(catalog_keys(&fx.folder).len(), 1);

    // corruption budget 1: the first failure is retried once
    assert_eq!(*generates.borrow(), 2);
}

#[test]
fn generate_only_moves_folders_without_archiving() {
    let fx = fixture(json!({"max_corrupted": 0, "max_failures": 0, "generate_only": true}));

    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    let unknown = completed(maker.run(vec![request(&fx, "out/direct", 5)]).unwrap());
    assert!(unknown.is_empty());

    assert!(fx.root.path().join("out/direct/result-5.txt").is_file());
    // nothing was archived
    assert!(catalog_keys(&fx.folder).is_empty());
    drop(maker);

    // running again: the destination already exists, so there is
    // nothing to do and no new generation
    let mut maker2 = Maker::new(fx.folder.clone(), None).unwrap();
    let generates = count_event(&mut maker2, "generate-start");
    let unknown = completed(maker2.run(vec![request(&fx, "out/direct", 5)]).unwrap());
    assert!(unknown.is_empty());
    assert_eq!(*generates.borrow(), 0);
}

#[test]
fn pause_save_resume_completes_the_run() {
    let fx = fixture(json!({"max_corrupted": 0, "max_failures": 0}));
    let state_path = fx.root.path().join("maker-state.json");

    {
        let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
        // the interrupt arrives before WAIT gets its first look at
        // the log
        maker
            .interrupt_flag()
            .store(true, std::sync::atomic::Ordering::SeqCst);
        match maker.run(vec![request(&fx, "out/paused", 6)]).unwrap() {
            RunOutcome::Paused => (),
            RunOutcome::Completed { .. } => panic!("expected a pause"),
        }
        assert!(maker.is_paused());
        // a paused maker refuses a fresh run
        assert!(maker.run(vec![]).is_err());
        maker.save_state(&state_path).unwrap();
    }

    // a fresh process: load the state and resume; the WAIT picks up
    // the same log file and the run completes as if uninterrupted
    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    assert!(maker.resume().is_err());
    maker.load_state(&state_path).unwrap();
    let unknown = completed(maker.resume().unwrap());
    assert!(unknown.is_empty());
    assert!(fx.root.path().join("out/paused/result-6.txt").is_file());
    assert_eq!(catalog_keys(&fx.folder).len(), 1);
}

#[test]
fn wrong_state_format_is_a_typed_error() {
    let fx = fixture(json!({}));
    let state_path = fx.root.path().join("state.json");
    std::fs::write(&state_path, "{\"simulations\": 42}").unwrap();

    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    let err = maker.load_state(&state_path).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<hateno::maker::MakerError>(),
        Some(hateno::maker::MakerError::MakerStateWrongFormat(_))
    ));
}

#[test]
fn identity_collapse_served_from_one_archive() {
    let fx = fixture(json!({"max_corrupted": 0, "max_failures": 0}));

    let mut maker = Maker::new(fx.folder.clone(), None).unwrap();
    // 2 and 2.0 share an identity through the intFloats fixer: one
    // simulation is generated, both destinations are materialized
    let mut r2 = request(&fx, "out/int", 2);
    let mut r2f = request(&fx, "out/float", 2);
    r2.settings[0].value = json!(2);
    r2f.settings[0].value = json!(2.0);
    let unknown = completed(maker.run(vec![r2, r2f]).unwrap());
    assert!(unknown.is_empty());

    assert!(fx.root.path().join("out/int/result-2.txt").is_file());
    assert!(fx.root.path().join("out/float/result-2.txt").is_file());
    assert_eq!(catalog_keys(&fx.folder).len(), 1);
}

#[test]
fn paths_helpers() {
    let fx = fixture(json!({}));
    assert!(fx
        .folder
        .running_manager_indicator_filename()
        .starts_with(fx.root.path()));
    assert_eq!(
        fx.folder.skeletons("launch.skeleton.sh"),
        fx.root
            .path()
            .join(Path::new(".hateno/skeletons/launch.skeleton.sh"))
    );
}
