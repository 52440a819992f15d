use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::{Property, PropertyQuery, StackFrame, VariableCategory};
use crate::proto;
use crate::session::error::Error;
use crate::session::handles::HandleTable;

/// A caller-visible variables reference resolves to either a scope marker
/// (frame + category, expanded on demand into the first level of real
/// variables) or a lazily-expandable property.
#[derive(Clone)]
pub enum VariableContainer {
    Scope {
        frame: Arc<dyn StackFrame>,
        category: VariableCategory,
    },
    Property(VariableEvaluationData),
}

/// An expandable property plus the query flags that produced it; children
/// are enumerated under the same flags.
#[derive(Clone)]
pub struct VariableEvaluationData {
    pub property: Arc<dyn Property>,
    pub query: PropertyQuery,
}

/// Builds the scope/variable tree on demand and owns the per-stop variable
/// handle table.
pub struct VariableManager {
    handles: HandleTable<VariableContainer>,
    /// Surfaced name -> property, per container handle. Consulted by
    /// data-breakpoint-info lookups after an expansion.
    expanded: Mutex<HashMap<i32, Vec<(String, Arc<dyn Property>)>>>,
}

impl VariableManager {
    pub fn new() -> Self {
        VariableManager {
            handles: HandleTable::new(),
            expanded: Mutex::new(HashMap::new()),
        }
    }

    /// Scopes are never deduplicated; every call allocates.
    pub fn create_scope(&self, frame: Arc<dyn StackFrame>, category: VariableCategory) -> i32 {
        self.handles
            .create(VariableContainer::Scope { frame, category })
    }

    pub fn try_get(&self, handle: i32) -> Option<VariableContainer> {
        self.handles.try_get(handle)
    }

    pub fn reset(&self) {
        self.handles.reset();
        self.expanded.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Expand a variables reference into the next level of variables.
    pub fn expand(&self, handle: i32, query: PropertyQuery) -> Result<Vec<proto::Variable>, Error> {
        let container = self
            .handles
            .try_get(handle)
            .ok_or_else(|| Error::VariableNotFound(handle.to_string()))?;

        // Children of an expandable value are produced under the same
        // flags that produced their parent.
        let (properties, effective_query) = match &container {
            VariableContainer::Scope { frame, category } => (
                frame
                    .properties(*category, query)
                    .map_err(|fault| Error::engine("Unable to enumerate variables", fault))?,
                query,
            ),
            VariableContainer::Property(data) => (
                data.property
                    .children(data.query)
                    .map_err(|fault| Error::engine("Unable to enumerate children", fault))?,
                data.query,
            ),
        };

        let mut seen: HashMap<String, u32> = HashMap::new();
        let mut variables = Vec::with_capacity(properties.len());
        let mut lookup = Vec::with_capacity(properties.len());

        for property in properties {
            let mut variable = self.create_variable(&property, effective_query)?;
            variable.name = disambiguate(&mut seen, variable.name);
            lookup.push((variable.name.clone(), property));
            variables.push(variable);
        }

        self.expanded.lock().unwrap().insert(handle, lookup);
        Ok(variables)
    }

    /// A property surfaced by an earlier expansion, by its surfaced
    /// (possibly disambiguated) name.
    pub fn find_expanded(&self, handle: i32, name: &str) -> Option<Arc<dyn Property>> {
        self.expanded
            .lock()
            .unwrap()
            .get(&handle)?
            .iter()
            .find(|(surfaced, _)| surfaced == name)
            .map(|(_, property)| property.clone())
    }

    /// Build a client variable from a property, allocating a child handle
    /// when the property is expandable (0 otherwise).
    pub fn create_variable(
        &self,
        property: &Arc<dyn Property>,
        query: PropertyQuery,
    ) -> Result<proto::Variable, Error> {
        let info = property
            .info(query)
            .map_err(|fault| Error::engine("Unable to read variable", fault))?;

        let variables_reference = if info.expandable {
            self.handles
                .create(VariableContainer::Property(VariableEvaluationData {
                    property: property.clone(),
                    query,
                }))
        } else {
            0
        };

        Ok(proto::Variable {
            name: info.name,
            value: info.value,
            type_name: info.type_name,
            variables_reference,
            evaluate_name: info.full_name,
            memory_reference: info.memory_reference,
        })
    }

    /// Assign a new value to the named child of a container. Engine error
    /// text, when present, is surfaced verbatim.
    pub fn set_variable(
        &self,
        handle: i32,
        name: &str,
        value: &str,
        query: PropertyQuery,
    ) -> Result<String, Error> {
        let container = self
            .handles
            .try_get(handle)
            .ok_or_else(|| Error::VariableNotFound(name.to_string()))?;

        let candidates = match &container {
            VariableContainer::Scope { frame, category } => frame
                .properties(*category, query)
                .map_err(|fault| Error::engine("Unable to enumerate variables", fault))?,
            VariableContainer::Property(data) => data
                .property
                .children(data.query)
                .map_err(|fault| Error::engine("Unable to enumerate children", fault))?,
        };

        let mut matched = None;
        for property in candidates {
            let info = property
                .info(query)
                .map_err(|fault| Error::engine("Unable to read variable", fault))?;
            if info.name == name {
                if info.read_only {
                    return Err(Error::VariableReadOnly(name.to_string()));
                }
                matched = Some(property);
                break;
            }
        }

        let property = matched.ok_or_else(|| Error::VariableNotFound(name.to_string()))?;
        property
            .set_value(value, query)
            .map_err(|fault| Error::SetVariableFailed(fault.describe().into_owned()))?;

        let info = property
            .info(query)
            .map_err(|fault| Error::engine("Unable to read variable", fault))?;
        Ok(info.value)
    }
}

impl Default for VariableManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconcile duplicate display names (common with anonymous unions): the
/// first occurrence keeps its name, later ones get a `" #<n>"` suffix
/// counting from 2.
fn disambiguate(seen: &mut HashMap<String, u32>, name: String) -> String {
    let count = seen.entry(name.clone()).or_insert(0);
    *count += 1;
    if *count == 1 {
        name
    } else {
        format!("{name} #{count}", count = *count)
    }
}
