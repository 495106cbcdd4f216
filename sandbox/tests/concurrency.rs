//! Independent instances run in parallel; one instance serializes its
//! callers; a shared cache compiles each binary once.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use tiffbridge_sandbox::{tags, CompilationCache, RuntimeConfig, TiffLibrary};

const THREADS: u32 = 8;
const ROUNDS: u32 = 50;

#[test]
fn test_instances_from_one_image_do_not_share_state() {
    init_tracing();
    let cache = CompilationCache::new().unwrap();
    let config = RuntimeConfig::default().with_cache(cache.clone());
    let barrier = Barrier::new(THREADS as usize);

    let results: Vec<(u32, u32, String)> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let config = &config;
                let barrier = &barrier;
                s.spawn(move || {
                    let lib = TiffLibrary::new(FAKE_LIBTIFF.as_bytes(), config.clone()).unwrap();
                    let (file, _sink) = create(&lib);
                    barrier.wait();
                    for round in 0..ROUNDS {
                        let width = t * 1000 + round;
                        file.set(tags::IMAGE_WIDTH, width).unwrap();
                        file.set_text(tags::SOFTWARE, &format!("writer {}", t)).unwrap();
                        assert_eq!(file.get::<u32>(tags::IMAGE_WIDTH).unwrap(), width);
                    }
                    (
                        t,
                        file.get::<u32>(tags::IMAGE_WIDTH).unwrap(),
                        file.get::<String>(tags::SOFTWARE).unwrap(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (t, width, software) in results {
        assert_eq!(width, t * 1000 + ROUNDS - 1);
        assert_eq!(software, format!("writer {}", t));
    }
    assert_eq!(cache.compilations(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_concurrent_compiles_of_identical_bytes_compile_once() {
    let cache = CompilationCache::new().unwrap();
    let barrier = Barrier::new(THREADS as usize);

    let digests: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    cache.compile(FAKE_LIBTIFF.as_bytes()).unwrap().digest()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(digests.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache.compilations(), 1);
    assert!(cache.contains(&digests[0]));
}

#[test]
fn test_one_instance_shared_across_threads() {
    let lib = library();
    let files: Vec<_> = (0..4u32).map(|d| open_dims(&lib, &[(d + 1, d + 1)])).collect();

    thread::scope(|s| {
        for (i, file) in files.iter().enumerate() {
            s.spawn(move || {
                for round in 0..ROUNDS {
                    let value = (i as u32) << 16 | round;
                    file.set(tags::TILE_WIDTH, value).unwrap();
                    assert_eq!(file.get::<u32>(tags::TILE_WIDTH).unwrap(), value);
                    assert_eq!(file.get::<u32>(tags::IMAGE_WIDTH).unwrap(), i as u32 + 1);
                }
            });
        }
    });

    assert_eq!(lib.instance().streams().len(), 4);
}

#[test]
fn test_library_handle_is_shareable() {
    let lib = Arc::new(library());
    thread::scope(|s| {
        for _ in 0..4 {
            let lib = Arc::clone(&lib);
            s.spawn(move || {
                for _ in 0..ROUNDS {
                    assert_eq!(lib.version().unwrap(), "LIBTIFF, Version 4.7.0");
                }
            });
        }
    });
}
