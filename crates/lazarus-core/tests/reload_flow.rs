//! End-to-end reload tests.
//!
//! Each test compiles a real guest cdylib with rustc, opens it through the
//! runtime, rewrites the artifact to trigger reload transactions, and
//! asserts on the observable context: versions, failure classification, and
//! the state carried across generations.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use lazarus_core::{FailureKind, OpenOptions, Plugin, SafetyMode};
use tempfile::TempDir;

fn dylib_extension() -> &'static str {
    if cfg!(windows) {
        "dll"
    } else if cfg!(target_os = "macos") {
        "dylib"
    } else {
        "so"
    }
}

/// A guest artifact that can be rebuilt mid-test.
struct Fixture {
    _temp: TempDir,
    dir: PathBuf,
    artifact: PathBuf,
    builds: u32,
}

impl Fixture {
    fn new(name: &str) -> Self {
        let temp = TempDir::new().expect("failed to create temp dir");
        let dir = temp.path().to_path_buf();
        let artifact = dir.join(format!("lib{}.{}", name, dylib_extension()));
        Self {
            _temp: temp,
            dir,
            artifact,
            builds: 0,
        }
    }

    /// Compile `source` over the artifact, as a user rebuild would.
    fn install(&mut self, source: &str) {
        self.builds += 1;
        let source_path = self.dir.join(format!("guest_build_{}.rs", self.builds));
        fs::write(&source_path, source).expect("failed to write guest source");

        let output = Command::new("rustc")
            .arg(&source_path)
            .arg("--crate-type=cdylib")
            .arg("--edition=2021")
            .arg("--crate-name=guest")
            .arg("-Copt-level=0")
            .arg("-o")
            .arg(&self.artifact)
            .output()
            .expect("failed to run rustc");
        assert!(
            output.status.success(),
            "guest compilation failed:\n{}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn staged(&self, name: &str, generation: u32) -> PathBuf {
        self.dir
            .join(format!("lib{}{}.{}", name, generation, dylib_extension()))
    }
}

const GUEST_PRELUDE: &str = r#"
use std::ffi::c_void;

#[repr(C)]
pub struct PluginContext {
    internal: *mut c_void,
    userdata: *mut c_void,
    version: u32,
    failure: i32,
    next_version: u32,
    last_working_version: u32,
}
"#;

const PERSISTENT_COUNTER: &str = r#"
#[cfg_attr(target_os = "macos", link_section = "__DATA,cr_state")]
#[cfg_attr(not(target_os = "macos"), link_section = "cr_state")]
#[used]
static mut COUNTER: u32 = 10;
"#;

/// Guest that increments a persistent counter on each step and reports
/// `version * 100 + counter`.
fn counter_guest(marker: &str) -> String {
    format!(
        r#"// build: {marker}
{GUEST_PRELUDE}
{PERSISTENT_COUNTER}
#[no_mangle]
pub unsafe extern "C" fn cr_main(ctx: *mut PluginContext, op: i32) -> i32 {{
    if op != 1 {{
        return 0;
    }}
    let counter = std::ptr::addr_of_mut!(COUNTER);
    *counter += 1;
    ((*ctx).version * 100 + *counter) as i32
}}
"#
    )
}

/// Same layout as [`counter_guest`], but dereferences null during `op`.
fn crashing_guest(crash_op: i32) -> String {
    format!(
        r#"{GUEST_PRELUDE}
{PERSISTENT_COUNTER}
#[no_mangle]
pub unsafe extern "C" fn cr_main(ctx: *mut PluginContext, op: i32) -> i32 {{
    if op == {crash_op} {{
        std::ptr::null_mut::<i32>().write_volatile(1);
    }}
    if op != 1 {{
        return 0;
    }}
    let counter = std::ptr::addr_of_mut!(COUNTER);
    *counter += 1;
    ((*ctx).version * 100 + *counter) as i32
}}
"#
    )
}

/// Counter guest that grew a second persistent static: the state section
/// changes shape and reloads into it must be refused.
fn grown_state_guest() -> String {
    format!(
        r#"{GUEST_PRELUDE}
{PERSISTENT_COUNTER}
#[cfg_attr(target_os = "macos", link_section = "__DATA,cr_state")]
#[cfg_attr(not(target_os = "macos"), link_section = "cr_state")]
#[used]
static mut LATECOMER: u32 = 0;

#[no_mangle]
pub unsafe extern "C" fn cr_main(ctx: *mut PluginContext, op: i32) -> i32 {{
    if op != 1 {{
        return 0;
    }}
    let counter = std::ptr::addr_of_mut!(COUNTER);
    *counter += 1;
    ((*ctx).version * 100 + *counter) as i32
}}
"#
    )
}

/// Guest with no state section at all; steps report the live version.
fn version_guest() -> String {
    format!(
        r#"{GUEST_PRELUDE}
#[no_mangle]
pub unsafe extern "C" fn cr_main(ctx: *mut PluginContext, op: i32) -> i32 {{
    if op != 1 {{
        return 0;
    }}
    (*ctx).version as i32
}}
"#
    )
}

/// Guest that rejects its own load.
fn rejecting_guest() -> String {
    format!(
        r#"{GUEST_PRELUDE}
#[no_mangle]
pub unsafe extern "C" fn cr_main(_ctx: *mut PluginContext, op: i32) -> i32 {{
    if op == 0 {{ 1 }} else {{ 0 }}
}}
"#
    )
}

/// Guest whose step asks the host to stop.
fn stopping_guest() -> String {
    format!(
        r#"{GUEST_PRELUDE}
#[no_mangle]
pub unsafe extern "C" fn cr_main(_ctx: *mut PluginContext, op: i32) -> i32 {{
    if op == 1 {{ -7 }} else {{ 0 }}
}}
"#
    )
}

fn assert_invariants(plugin: &Plugin) {
    assert!(
        plugin.version() <= plugin.last_working_version(),
        "version {} > last_working_version {}",
        plugin.version(),
        plugin.last_working_version()
    );
    assert!(
        plugin.last_working_version() <= plugin.next_version() - 1,
        "last_working_version {} > next_version {} - 1",
        plugin.last_working_version(),
        plugin.next_version()
    );
}

#[test]
fn first_load_goes_live_as_generation_one() {
    let mut fixture = Fixture::new("first");
    fixture.install(&version_guest());

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    assert_eq!(plugin.version(), 1);
    assert_eq!(plugin.next_version(), 2);

    assert_eq!(plugin.update(), 1);
    assert_eq!(plugin.failure(), FailureKind::None);
    assert_invariants(&plugin);
}

#[test]
fn steady_state_keeps_the_first_generation() {
    let mut fixture = Fixture::new("steady");
    fixture.install(&version_guest());

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    for _ in 0..5 {
        assert_eq!(plugin.update(), 1);
        assert_eq!(plugin.version(), 1);
        assert_invariants(&plugin);
    }
}

#[test]
fn open_then_close_leaves_no_staged_files() {
    let mut fixture = Fixture::new("tidy");
    fixture.install(&version_guest());

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    plugin.close();
    assert!(plugin.is_closed());
    assert_eq!(plugin.version(), 0);

    assert!(fixture.artifact.exists());
    assert!(!fixture.staged("tidy", 1).exists());
}

#[test]
fn negative_step_status_passes_through() {
    let mut fixture = Fixture::new("stop");
    fixture.install(&stopping_guest());

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    assert_eq!(plugin.update(), -7);
    // Not a fault: the guest simply asked the host to stop.
    assert_eq!(plugin.failure(), FailureKind::None);
}

#[test]
fn guest_rejecting_load_fails_open_with_user_failure() {
    let mut fixture = Fixture::new("reject");
    fixture.install(&rejecting_guest());

    let err = Plugin::open(&fixture.artifact).unwrap_err();
    assert_eq!(err.failure_kind(), FailureKind::User);
}

/// The long scenario chain from the reference behavior: state carry across
/// a reload, a crash in step, a crash in load, a crash in unload, and a
/// state-shape change, with rollbacks in between.
#[test]
fn state_carry_crash_and_rollback_chain() {
    let mut fixture = Fixture::new("chain");

    // Generation 1: counter starts at 10 and increments per step.
    fixture.install(&counter_guest("first"));
    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    assert_eq!(plugin.update(), 111);
    assert_eq!(plugin.update(), 112);
    assert_eq!(plugin.version(), 1);
    assert_invariants(&plugin);

    // Rebuild: generation 2 carries the counter across the reload.
    fixture.install(&counter_guest("second"));
    assert_eq!(plugin.update(), 213);
    assert_eq!(plugin.version(), 2);
    assert_eq!(plugin.failure(), FailureKind::None);
    assert_eq!(plugin.update(), 214);
    assert_invariants(&plugin);

    // Generation 3 crashes in its step: the version decrements and the
    // state observed right before the faulting step survives the rollback.
    fixture.install(&crashing_guest(1));
    assert_eq!(plugin.update(), lazarus_core::STEP_FAULT);
    assert_eq!(plugin.failure(), FailureKind::Segfault);
    assert_eq!(plugin.version(), 2);
    assert_eq!(plugin.next_version(), 4);
    assert_invariants(&plugin);

    // Without another rebuild the next pump runs the rolled-back image.
    assert_eq!(plugin.update(), 215);
    assert_eq!(plugin.failure(), FailureKind::None);

    // Generation 4 crashes in its load: the transaction is abandoned and
    // the previous generation keeps running with its unload-time state.
    fixture.install(&crashing_guest(0));
    assert_eq!(plugin.update(), lazarus_core::RELOAD_FAULT);
    assert_eq!(plugin.failure(), FailureKind::Segfault);
    assert_eq!(plugin.version(), 2);
    assert_eq!(plugin.next_version(), 5);
    assert_invariants(&plugin);
    assert_eq!(plugin.update(), 216);

    // Generation 5 loads and steps fine but crashes in its unload, so the
    // next reload rolls back past it to the previous stable generation.
    fixture.install(&crashing_guest(2));
    assert_eq!(plugin.update(), 517);
    assert_eq!(plugin.version(), 5);
    assert_eq!(plugin.update(), 518);

    fixture.install(&counter_guest("after the crasher"));
    assert_eq!(plugin.update(), lazarus_core::RELOAD_FAULT);
    assert_eq!(plugin.failure(), FailureKind::Segfault);
    assert_eq!(plugin.version(), 2);
    assert_invariants(&plugin);
    assert_eq!(plugin.update(), 219);
    assert_eq!(plugin.failure(), FailureKind::None);

    // A new persistent static changes the section shape: the reload is
    // refused and the running generation keeps its state.
    fixture.install(&grown_state_guest());
    assert_eq!(plugin.update(), lazarus_core::RELOAD_FAULT);
    assert_eq!(plugin.failure(), FailureKind::StateInvalidated);
    assert_eq!(plugin.version(), 2);
    assert_invariants(&plugin);
    assert_eq!(plugin.update(), 220);

    // Teardown deletes every staged generation but not the artifact.
    let final_next = plugin.next_version();
    plugin.close();
    for generation in 1..final_next {
        assert!(
            !fixture.staged("chain", generation).exists(),
            "staged copy {} survived close",
            generation
        );
    }
    assert!(fixture.artifact.exists());
}

#[test]
fn disable_mode_reloads_without_carrying_state() {
    let mut fixture = Fixture::new("fresh");
    fixture.install(&counter_guest("first"));

    let mut plugin = Plugin::open_with(
        &fixture.artifact,
        OpenOptions::default().mode(SafetyMode::Disable),
    )
    .expect("open failed");
    assert_eq!(plugin.update(), 111);
    assert_eq!(plugin.update(), 112);

    // The new generation starts from its initializer: no transfer at all.
    fixture.install(&counter_guest("second"));
    assert_eq!(plugin.update(), 211);
}

#[test]
fn unsafe_mode_still_carries_the_declared_section() {
    let mut fixture = Fixture::new("brave");
    fixture.install(&counter_guest("first"));

    let mut plugin = Plugin::open_with(
        &fixture.artifact,
        OpenOptions::default().mode(SafetyMode::Unsafe),
    )
    .expect("open failed");
    assert_eq!(plugin.update(), 111);

    fixture.install(&counter_guest("second"));
    assert_eq!(plugin.update(), 212);
    assert_eq!(plugin.version(), 2);
}

#[test]
fn staging_in_a_separate_temp_dir() {
    let mut fixture = Fixture::new("routed");
    fixture.install(&version_guest());
    let stage_dir = fixture.dir.join("stage");
    fs::create_dir_all(&stage_dir).unwrap();

    let mut plugin = Plugin::open_with(
        &fixture.artifact,
        OpenOptions::default().temp_dir(&stage_dir),
    )
    .expect("open failed");
    assert_eq!(plugin.update(), 1);

    assert!(
        stage_dir
            .join(format!("librouted1.{}", dylib_extension()))
            .exists()
    );
    assert!(!fixture.staged("routed", 1).exists());

    plugin.close();
    assert!(
        !stage_dir
            .join(format!("librouted1.{}", dylib_extension()))
            .exists()
    );
}

#[test]
fn stale_copies_are_swept_on_open() {
    let mut fixture = Fixture::new("sweep");
    fixture.install(&version_guest());

    // Leftovers from a "crashed" previous host run.
    let stale = fixture.staged("sweep", 9);
    fs::write(&stale, b"stale copy").unwrap();

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    assert!(!stale.exists());
    assert_eq!(plugin.update(), 1);
}

/// Regression guard for path handling: artifacts without the `lib` prefix
/// and with dotted names stage correctly.
#[test]
fn dotted_artifact_names_stage_cleanly() {
    let mut fixture = Fixture::new("dotted.name");
    fixture.install(&version_guest());

    let mut plugin = Plugin::open(&fixture.artifact).expect("open failed");
    assert_eq!(plugin.update(), 1);
    assert!(
        fixture
            .dir
            .join(format!("libdotted.name1.{}", dylib_extension()))
            .exists()
    );
}
