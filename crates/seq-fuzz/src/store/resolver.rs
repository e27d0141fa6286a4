//! Two-phase resolution of cross-references after a load.
//!
//! Forms are read in file order, so a reference may point at a form that has
//! not been constructed yet. Readers therefore enqueue closures instead of
//! resolving ids in place: once every envelope has been read, [`LoadResolver::resolve`]
//! runs the early tasks and [`LoadResolver::resolve_late`] the late ones.
//! The split breaks ordering dependencies and reference cycles.

use std::sync::Arc;

use tracing::warn;

use super::data::Data;
use super::{Form, FormId};

type TaskFn = Box<dyn FnOnce(&Data) + Send>;

#[derive(Default)]
pub struct LoadResolver {
    tasks: Vec<TaskFn>,
    late_tasks: Vec<TaskFn>,
}

impl std::fmt::Debug for LoadResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadResolver")
            .field("tasks", &self.tasks.len())
            .field("late_tasks", &self.late_tasks.len())
            .finish()
    }
}

impl LoadResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a task for the first pass, run once all forms are present.
    pub fn add_task(&mut self, task: impl FnOnce(&Data) + Send + 'static) {
        self.tasks.push(Box::new(task));
    }

    /// Enqueues a task for the second pass, run once every early task has
    /// completed.
    pub fn add_late_task(&mut self, task: impl FnOnce(&Data) + Send + 'static) {
        self.late_tasks.push(Box::new(task));
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len() + self.late_tasks.len()
    }

    pub fn resolve(&mut self, data: &Data) {
        for task in self.tasks.drain(..) {
            task(data);
        }
    }

    pub fn resolve_late(&mut self, data: &Data) {
        for task in self.late_tasks.drain(..) {
            task(data);
        }
    }

    /// Looks up `id` as a `T`, logging when the reference dangles.
    pub fn resolve_form<T: Form>(data: &Data, id: FormId) -> Option<Arc<T>> {
        let form = data.lookup_form::<T>(id);
        if form.is_none() && id != 0 {
            warn!(form_id = id, "cannot resolve form reference");
        }
        form
    }
}
