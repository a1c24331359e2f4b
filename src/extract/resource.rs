use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::naming::normalize_identifier;
use crate::schema::WriteDisposition;

/// A transformation applied to every item flowing through a resource pipe.
/// Returning an empty vec filters the item out; returning several fans out.
pub(crate) type PipeStep = Box<dyn FnMut(Value) -> Vec<Value> + Send>;

/// A named data-producing unit: rows from an iterator, routed to a
/// destination table, optionally derived from another resource's output.
pub struct Resource {
    pub(crate) name: String,
    pub(crate) table: Option<String>,
    pub(crate) write_disposition: WriteDisposition,
    pub(crate) depends_on: Option<String>,
    pub(crate) head: Option<Box<dyn Iterator<Item = Value> + Send>>,
    pub(crate) steps: Vec<PipeStep>,
}

impl Resource {
    /// Creates a resource from anything iterable over JSON rows. The name
    /// doubles as the destination table name unless [`table`](Self::table)
    /// overrides it.
    pub fn new<I>(name: impl Into<String>, data: I) -> Self
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        Self {
            name: name.into(),
            table: None,
            write_disposition: WriteDisposition::default(),
            depends_on: None,
            head: Some(Box::new(data.into_iter())),
            steps: Vec::new(),
        }
    }

    /// Creates a resource fed by another resource's items. The transform
    /// receives every item the parent yields and produces this resource's
    /// rows, which establishes an execution dependency: this resource never
    /// runs ahead of its parent.
    pub fn derived(
        name: impl Into<String>,
        depends_on: impl Into<String>,
        transform: impl FnMut(Value) -> Vec<Value> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            table: None,
            write_disposition: WriteDisposition::default(),
            depends_on: Some(depends_on.into()),
            head: None,
            steps: vec![Box::new(transform)],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides the destination table name.
    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = Some(name.into());
        self
    }

    pub fn write_disposition(mut self, disposition: WriteDisposition) -> Self {
        self.write_disposition = disposition;
        self
    }

    /// Appends a per-item mapping step to the pipe.
    pub fn add_map(mut self, mut f: impl FnMut(Value) -> Value + Send + 'static) -> Self {
        self.steps.push(Box::new(move |item| vec![f(item)]));
        self
    }

    /// Appends a filter step; items failing the predicate are dropped.
    pub fn add_filter(mut self, mut f: impl FnMut(&Value) -> bool + Send + 'static) -> Self {
        self.steps
            .push(Box::new(move |item| if f(&item) { vec![item] } else { vec![] }));
        self
    }

    /// The normalized destination table name.
    pub fn table_name(&self) -> String {
        normalize_identifier(self.table.as_deref().unwrap_or(&self.name))
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name)
            .field("table", &self.table_name())
            .field("write_disposition", &self.write_disposition)
            .field("depends_on", &self.depends_on)
            .field("steps", &self.steps.len())
            .finish()
    }
}

/// A named collection of resources extracted together under one schema.
pub struct Source {
    name: String,
    resources: Vec<Resource>,
}

impl Source {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Adds a resource, rejecting duplicate names up front.
    pub fn resource(mut self, resource: Resource) -> Result<Self> {
        if self.resources.iter().any(|r| r.name == resource.name) {
            return Err(PipelineError::Source(format!(
                "duplicate resource name '{}'",
                resource.name
            )));
        }
        self.resources.push(resource);
        Ok(self)
    }

    /// Validates dependency wiring: every `depends_on` target exists and
    /// the dependency graph is acyclic.
    pub(crate) fn validate(&self) -> Result<()> {
        for resource in &self.resources {
            let mut seen = vec![resource.name.as_str()];
            let mut current = resource;
            while let Some(parent_name) = &current.depends_on {
                let parent = self
                    .resources
                    .iter()
                    .find(|r| &r.name == parent_name)
                    .ok_or_else(|| {
                        PipelineError::Source(format!(
                            "resource '{}' depends on unknown resource '{}'",
                            current.name, parent_name
                        ))
                    })?;
                if seen.contains(&parent.name.as_str()) {
                    return Err(PipelineError::Source(format!(
                        "dependency cycle through resource '{}'",
                        parent.name
                    )));
                }
                seen.push(parent.name.as_str());
                current = parent;
            }
        }
        Ok(())
    }

    pub(crate) fn into_resources(self) -> Vec<Resource> {
        self.resources
    }
}
