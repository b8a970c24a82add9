// Copyright 2026 stowage Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    future::Future,
    mem::ManuallyDrop,
    ops::Deref,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    runtime::{Handle, Runtime},
    task::{AbortHandle, JoinHandle},
};

use crate::error::{Error, ErrorKind, Result};

/// A wrapper around [`Runtime`] that shuts down the runtime in the background when dropped.
///
/// This is necessary because directly dropping a nested runtime is not allowed in a parent runtime.
pub struct BackgroundShutdownRuntime(ManuallyDrop<Runtime>);

impl Debug for BackgroundShutdownRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BackgroundShutdownRuntime").finish()
    }
}

impl Drop for BackgroundShutdownRuntime {
    fn drop(&mut self) {
        // Safety: The runtime is only dropped once here.
        let runtime = unsafe { ManuallyDrop::take(&mut self.0) };
        runtime.shutdown_background();
    }
}

impl Deref for BackgroundShutdownRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Runtime> for BackgroundShutdownRuntime {
    fn from(runtime: Runtime) -> Self {
        Self(ManuallyDrop::new(runtime))
    }
}

/// A wrapper for [`JoinHandle`] that maps join failures into [`Error`].
#[derive(Debug)]
pub struct SpawnHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> SpawnHandle<T> {
    /// Get an abort handle of the spawned task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.inner.abort_handle()
    }
}

impl<T> Future for SpawnHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(Ok(v)) => Poll::Ready(Ok(v)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::new(ErrorKind::Join, "tokio join error").with_source(e))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A wrapper around a dedicated tokio runtime or handle to spawn background tasks.
///
/// The write-back cache runs its batched writer and its eviction timers on a [`Spawner`].
#[derive(Debug, Clone)]
pub enum Spawner {
    /// A dedicated runtime to spawn tasks.
    Runtime(Arc<BackgroundShutdownRuntime>),
    /// A handle to spawn tasks.
    Handle(Handle),
}

impl From<Runtime> for Spawner {
    fn from(runtime: Runtime) -> Self {
        Self::Runtime(Arc::new(runtime.into()))
    }
}

impl From<Handle> for Spawner {
    fn from(handle: Handle) -> Self {
        Self::Handle(handle)
    }
}

impl Spawner {
    /// Build a spawner backed by a dedicated multi-thread runtime with the given worker threads.
    pub fn dedicated(name: &str, worker_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(format!("{name}-bg"))
            .enable_all()
            .build()
            .map_err(|e| {
                Error::new(ErrorKind::Config, "failed to build background runtime")
                    .with_context("name", name)
                    .with_source(e)
            })?;
        Ok(runtime.into())
    }

    /// Wrapper for [`Runtime::spawn`] or [`Handle::spawn`].
    pub fn spawn<F>(&self, future: F) -> SpawnHandle<<F as Future>::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let inner = match self {
            Spawner::Runtime(rt) => rt.spawn(future),
            Spawner::Handle(h) => h.spawn(future),
        };
        SpawnHandle { inner }
    }

    /// Wrapper for [`Runtime::spawn_blocking`] or [`Handle::spawn_blocking`].
    pub fn spawn_blocking<F, R>(&self, func: F) -> SpawnHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = match self {
            Spawner::Runtime(rt) => rt.spawn_blocking(func),
            Spawner::Handle(h) => h.spawn_blocking(func),
        };
        SpawnHandle { inner }
    }

    /// Get the current spawner.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime.
    pub fn current() -> Self {
        Spawner::Handle(Handle::current())
    }
}
