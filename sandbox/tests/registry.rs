//! Command registry and program-mode runs.

mod common;

use common::*;
use tiffbridge_sandbox::{
    BridgeError, CommandRegistry, CompilationCache, OutputTarget, RandomSource, RuntimeConfig,
};

fn registry() -> CommandRegistry {
    init_tracing();
    let registry = CommandRegistry::new();
    registry.register("echo", ECHO_TOOL.as_bytes().to_vec());
    registry.register("trap", TRAP_TOOL.as_bytes().to_vec());
    registry.register("spin", SPIN_TOOL.as_bytes().to_vec());
    registry
}

/// Run the echo tool with captured stdout and return the random tail.
fn echo_random(random: RandomSource) -> Vec<u8> {
    let (stdout, capture) = OutputTarget::capture();
    let config = RuntimeConfig::default().with_stdout(stdout).with_random(random);
    registry().run("echo", &[], &config).unwrap();
    let out = capture.contents();
    assert_eq!(out.len(), 16 + 8);
    out[16..].to_vec()
}

#[test]
fn test_unknown_tool_compiles_nothing() {
    let cache = CompilationCache::new().unwrap();
    let config = RuntimeConfig::default().with_cache(cache.clone());

    match registry().run("tiffcrop", &[], &config) {
        Err(BridgeError::UnknownTool(name)) => assert_eq!(name, "tiffcrop"),
        other => panic!("expected UnknownTool, got {:?}", other),
    }
    assert_eq!(cache.compilations(), 0);
}

#[test]
fn test_output_is_captured() {
    let (stdout, out) = OutputTarget::capture();
    let (stderr, err) = OutputTarget::capture();
    let config = RuntimeConfig::default().with_stdout(stdout).with_stderr(stderr);

    registry().run("echo", &[], &config).unwrap();
    assert!(out.to_string_lossy().starts_with("tool says hello\n"));
    assert_eq!(err.to_string_lossy(), "tool stderr\n");
}

#[test]
fn test_exit_status() {
    let registry = registry();
    let args = vec!["-v".to_string(), "in.tif".to_string()];

    match registry.run("echo", &args, &RuntimeConfig::default()) {
        Err(BridgeError::ExitStatus { code }) => assert_eq!(code, 2),
        other => panic!("expected ExitStatus, got {:?}", other),
    }
    let err = registry
        .run("echo", &args[..1], &RuntimeConfig::default())
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(1));
}

#[test]
fn test_seeded_randomness_is_reproducible() {
    let first = echo_random(RandomSource::Seeded(7));
    let again = echo_random(RandomSource::Seeded(7));
    let other = echo_random(RandomSource::Seeded(8));

    assert_eq!(first, again);
    assert_ne!(first, other);
}

#[test]
fn test_os_randomness_varies() {
    // eight random bytes colliding twice in a row would be remarkable
    let a = echo_random(RandomSource::Os);
    let b = echo_random(RandomSource::Os);
    let c = echo_random(RandomSource::Os);
    assert!(a != b || b != c);
}

#[test]
fn test_trapping_tool() {
    match registry().run("trap", &[], &RuntimeConfig::default()) {
        Err(BridgeError::Trap { export, .. }) => assert_eq!(export, "_start"),
        other => panic!("expected Trap, got {:?}", other),
    }
}

#[test]
fn test_runaway_tool_runs_out_of_fuel() {
    let config = RuntimeConfig::default().with_fuel_limit(1_000_000);
    match registry().run("spin", &[], &config) {
        Err(BridgeError::FuelExhausted { export }) => assert_eq!(export, "_start"),
        other => panic!("expected FuelExhausted, got {:?}", other),
    }
}

#[test]
fn test_runs_share_the_compilation_cache() {
    let cache = CompilationCache::new().unwrap();
    let config = RuntimeConfig::default().with_cache(cache.clone());
    let registry = registry();

    for _ in 0..3 {
        registry.run("echo", &[], &config).unwrap();
    }
    registry.run("trap", &[], &config).unwrap_err();
    assert_eq!(cache.compilations(), 2);
}

#[test]
fn test_registration_and_listing() {
    let registry = registry();
    assert!(!registry.register("echo", TRAP_TOOL.as_bytes().to_vec()));
    assert_eq!(registry.list(), vec!["echo", "spin", "trap"]);
    assert!(registry.contains("spin"));

    // the first registration still runs
    registry.run("echo", &[], &RuntimeConfig::default()).unwrap();
}

#[test]
fn test_global_registry_is_shared() {
    let name = "registry-test-echo";
    CommandRegistry::global().register(name, ECHO_TOOL.as_bytes().to_vec());
    assert!(CommandRegistry::global().contains(name));
    CommandRegistry::global()
        .run(name, &[], &RuntimeConfig::default())
        .unwrap();
}
