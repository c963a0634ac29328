//! Name-keyed registries of component constructors.
//!
//! A [`Factory`] maps a name to a constructor plus an optional parameter
//! schema; a [`GroupFactory`] nests factories under category keys (API
//! name, dataset, matrix). Lookup of an unknown name is a `None`, never an
//! error; construction itself may fail and that failure is a first-class
//! outcome handled by the caller.

use crate::errors::CoreError;
use crate::params::{ParamSchema, Params};

/// A component constructor: receives the entry name, the resolved
/// parameters, and the category's construction context.
pub type Constructor<T, C> =
    Box<dyn Fn(&str, &Params, &C) -> Result<T, CoreError> + Send + Sync>;

/// Produces the parameter schema of an entry.
pub type SchemaFn = Box<dyn Fn() -> ParamSchema + Send + Sync>;

struct Entry<T, C> {
    name: String,
    constructor: Constructor<T, C>,
    schema: Option<SchemaFn>,
}

/// Registry mapping names to constructors within one component category.
pub struct Factory<T, C> {
    name: String,
    entries: Vec<Entry<T, C>>,
}

impl<T, C> Factory<T, C> {
    /// Creates an empty factory with the given category name.
    pub fn new(name: &str) -> Factory<T, C> {
        Factory {
            name: name.to_owned(),
            entries: Vec::new(),
        }
    }

    /// The category name of this factory.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a constructor under a unique name.
    pub fn add(
        &mut self,
        name: &str,
        constructor: Constructor<T, C>,
        schema: Option<SchemaFn>,
    ) -> Result<(), CoreError> {
        if self.is_available(name) {
            return Err(CoreError::Logic(format!(
                "'{}' already exists in factory '{}'",
                name, self.name
            )));
        }

        self.entries.push(Entry {
            name: name.to_owned(),
            constructor,
            schema,
        });
        Ok(())
    }

    /// Whether a name is registered.
    pub fn is_available(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    /// The registered names, in registration order.
    pub fn available_names(&self) -> Vec<&str> {
        self.entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    /// The parameter schema of an entry; empty for unknown or schema-less
    /// entries.
    pub fn create_params(&self, name: &str) -> ParamSchema {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .and_then(|entry| entry.schema.as_ref())
            .map(|schema| schema())
            .unwrap_or_default()
    }

    /// Constructs the named component. `None` when the name is unknown;
    /// missing parameters are filled from the schema defaults.
    pub fn create(
        &self,
        name: &str,
        params: Option<&Params>,
        context: &C,
    ) -> Option<Result<T, CoreError>> {
        let entry = self.entries.iter().find(|entry| entry.name == name)?;
        let resolved = self.create_params(name).resolved(params);

        Some((entry.constructor)(name, &resolved, context))
    }
}

/// A child of a [`GroupFactory`].
pub enum FactoryNode<T, C> {
    /// A leaf factory of constructors.
    Leaf(Factory<T, C>),
    /// A nested group of factories.
    Group(GroupFactory<T, C>),
}

impl<T, C> FactoryNode<T, C> {
    fn name(&self) -> &str {
        match self {
            FactoryNode::Leaf(factory) => factory.name(),
            FactoryNode::Group(group) => group.name(),
        }
    }
}

/// Factories nested under category keys.
pub struct GroupFactory<T, C> {
    name: String,
    children: Vec<FactoryNode<T, C>>,
}

impl<T, C> GroupFactory<T, C> {
    /// Creates an empty group with the given name.
    pub fn new(name: &str) -> GroupFactory<T, C> {
        GroupFactory {
            name: name.to_owned(),
            children: Vec::new(),
        }
    }

    /// The category name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a child factory or group, keyed by its own name.
    pub fn add(&mut self, node: FactoryNode<T, C>) -> Result<(), CoreError> {
        if self.child(node.name()).is_some() {
            return Err(CoreError::Logic(format!(
                "'{}' already exists in group '{}'",
                node.name(),
                self.name
            )));
        }

        self.children.push(node);
        Ok(())
    }

    /// Looks up a direct child by key.
    pub fn child(&self, name: &str) -> Option<&FactoryNode<T, C>> {
        self.children.iter().find(|child| child.name() == name)
    }

    /// Looks up a direct child leaf factory by key.
    pub fn child_factory(&self, name: &str) -> Option<&Factory<T, C>> {
        match self.child(name)? {
            FactoryNode::Leaf(factory) => Some(factory),
            FactoryNode::Group(_) => None,
        }
    }

    /// The child keys, in registration order.
    pub fn available_names(&self) -> Vec<&str> {
        self.children.iter().map(|child| child.name()).collect()
    }

    /// Linearly scans the direct child leaf factories (not recursively)
    /// for the first one that has `name` registered.
    pub fn resolve_factory(&self, name: &str) -> Option<&Factory<T, C>> {
        self.children.iter().find_map(|child| match child {
            FactoryNode::Leaf(factory) if factory.is_available(name) => Some(factory),
            _ => None,
        })
    }
}

/// Navigates a dataset-keyed group to the leaf factory of one matrix.
pub fn resolve_nested<'a, T, C>(
    group: &'a GroupFactory<T, C>,
    dataset: &str,
    matrix: &str,
) -> Option<&'a Factory<T, C>> {
    match group.child(dataset)? {
        FactoryNode::Group(dataset_group) => dataset_group.child_factory(matrix),
        FactoryNode::Leaf(_) => None,
    }
}
