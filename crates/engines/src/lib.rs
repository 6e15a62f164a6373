//! Local inference engines for on-device chat.
//!
//! Backend detection, the uniform [`engine::Engine`] contract, the
//! accelerated and CPU/worker engine implementations, the model registry and
//! artifact cache, and the orchestrating [`service::InferenceService`].

// FFI wrappers for llama-cpp-2 require unsafe Send/Sync impls when the
// runtime-llama feature is enabled.
#![cfg_attr(feature = "runtime-llama", allow(unsafe_code))]

pub mod cache;
pub mod cpu;
pub mod detect;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod models;
pub mod prompt;
pub mod runtime;
pub mod service;
mod worker;

#[cfg(feature = "runtime-llama")]
pub mod llama;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod testing;

pub use {
    detect::DetectionPrefs,
    engine::{
        Backend, ChatMessage, Engine, EngineConfig, ProgressFn, ProgressReport, Role, TokenFn,
    },
    error::{GenerateError, InitError},
    runtime::RuntimeLoader,
    service::{EngineStatus, InferenceService},
};

// Poisoned locks carry no invariants worth propagating here; take the guard
// either way.

pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn read<T>(rwlock: &std::sync::RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub(crate) fn write<T>(rwlock: &std::sync::RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
