use serde_json::Value;

use super::resource::{PipeStep, Resource, Source};
use crate::error::Result;
use crate::schema::WriteDisposition;

/// A fully evaluated item: one row bound for a destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct PipeItem {
    pub table: String,
    pub row: Value,
}

/// The evaluation plan of one resource: its transform steps plus routing
/// to the pipes of resources derived from it.
struct Pipe {
    table: String,
    write_disposition: WriteDisposition,
    steps: Vec<PipeStep>,
    children: Vec<usize>,
}

/// A unit of pending work: an item positioned before step `step` of pipe
/// `pipe`. `step == steps.len()` means the item cleared the pipe and is
/// ready to be routed and yielded.
struct WorkItem {
    item: Value,
    pipe: usize,
    step: usize,
}

/// Evaluates a set of resource pipes into a stream of table-bound rows.
///
/// Head iterators are kept on a stack and items are pulled from the most
/// recently added source first, so fan-out produced by a step drains before
/// its producer resumes. Items that clear a pipe are forked to every child
/// pipe and then yielded for the pipe's own table, so a parent resource
/// still produces its own rows while feeding derived resources.
pub struct PipeIterator {
    pipes: Vec<Pipe>,
    sources: Vec<(Box<dyn Iterator<Item = Value> + Send>, usize)>,
    work: Vec<WorkItem>,
}

impl PipeIterator {
    /// Builds the iterator from a source, wiring `depends_on` links into
    /// parent → child routing.
    pub fn from_source(source: Source) -> Result<Self> {
        source.validate()?;
        let resources = source.into_resources();

        let index_of = |name: &str, resources: &[Resource]| {
            resources.iter().position(|r| r.name == name)
        };

        let mut children: Vec<Vec<usize>> = vec![Vec::new(); resources.len()];
        for (idx, resource) in resources.iter().enumerate() {
            if let Some(parent) = &resource.depends_on {
                if let Some(parent_idx) = index_of(parent, &resources) {
                    children[parent_idx].push(idx);
                }
            }
        }

        let mut pipes = Vec::with_capacity(resources.len());
        let mut sources = Vec::new();
        for (idx, mut resource) in resources.into_iter().enumerate() {
            if let Some(head) = resource.head.take() {
                sources.push((head, idx));
            }
            pipes.push(Pipe {
                table: resource.table_name(),
                write_disposition: resource.write_disposition,
                steps: resource.steps,
                children: std::mem::take(&mut children[idx]),
            });
        }
        // Taking from the top of the stack should evaluate resources in
        // declaration order.
        sources.reverse();

        Ok(Self {
            pipes,
            sources,
            work: Vec::new(),
        })
    }

    /// Write dispositions per destination table, for schema construction.
    pub fn table_dispositions(&self) -> Vec<(String, WriteDisposition)> {
        self.pipes
            .iter()
            .map(|p| (p.table.clone(), p.write_disposition))
            .collect()
    }

    fn route_completed(&mut self, pipe_idx: usize, item: Value) -> PipeItem {
        let table = self.pipes[pipe_idx].table.clone();
        let children = self.pipes[pipe_idx].children.clone();
        // Children enter at their first step; push in reverse so the first
        // declared child runs first off the work stack.
        for &child in children.iter().rev() {
            self.work.push(WorkItem {
                item: item.clone(),
                pipe: child,
                step: 0,
            });
        }
        PipeItem { table, row: item }
    }
}

impl Iterator for PipeIterator {
    type Item = PipeItem;

    fn next(&mut self) -> Option<PipeItem> {
        loop {
            if let Some(WorkItem { item, pipe, step }) = self.work.pop() {
                if step == self.pipes[pipe].steps.len() {
                    return Some(self.route_completed(pipe, item));
                }
                let outputs = (self.pipes[pipe].steps[step])(item);
                for output in outputs.into_iter().rev() {
                    self.work.push(WorkItem {
                        item: output,
                        pipe,
                        step: step + 1,
                    });
                }
                continue;
            }

            // No pending work: pull the next item from the newest source.
            let (source, pipe_idx) = self.sources.last_mut()?;
            match source.next() {
                Some(item) => {
                    let pipe = *pipe_idx;
                    self.work.push(WorkItem {
                        item,
                        pipe,
                        step: 0,
                    });
                }
                None => {
                    self.sources.pop();
                }
            }
        }
    }
}
