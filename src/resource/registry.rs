//! Registry of resource types the resource service will accept.
//!
//! A registration carries the type's scope, the protobuf message its data
//! must hold and optional mutate/validate hooks run before every write.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use super::type_string;
use crate::resourcepb::{Resource, Type};

/// Runs before validation and may fill in defaults.
pub type MutateHook = Arc<dyn Fn(&mut Resource) -> Result<(), String> + Send + Sync>;

/// Rejects malformed resources with a human readable reason.
pub type ValidateHook = Arc<dyn Fn(&Resource) -> Result<(), String> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("resource type {0} not registered")]
    NotRegistered(String),

    #[error("resource type {0} already registered")]
    AlreadyRegistered(String),
}

/// Which tenancy fields a type uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Partition scoped types must leave the namespace empty.
    Partition,
    Namespace,
}

#[derive(Clone)]
pub struct Registration {
    pub resource_type: Type,
    pub scope: Scope,
    /// Fully qualified protobuf message name the data `Any` must contain.
    pub data_type: Option<String>,
    pub validate: Option<ValidateHook>,
    pub mutate: Option<MutateHook>,
}

impl Registration {
    pub fn new(resource_type: Type) -> Self {
        Self {
            resource_type,
            scope: Scope::Namespace,
            data_type: None,
            validate: None,
            mutate: None,
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = Some(data_type.into());
        self
    }

    pub fn with_validate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Resource) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(hook));
        self
    }

    pub fn with_mutate<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Resource) -> Result<(), String> + Send + Sync + 'static,
    {
        self.mutate = Some(Arc::new(hook));
        self
    }

    pub fn run_validate(&self, res: &Resource) -> Result<(), String> {
        match &self.validate {
            Some(hook) => hook(res),
            None => Ok(()),
        }
    }

    pub fn run_mutate(&self, res: &mut Resource) -> Result<(), String> {
        match &self.mutate {
            Some(hook) => hook(res),
            None => Ok(()),
        }
    }

    /// Checks the data payload's type url against the registered message.
    /// Returns the offending message name on mismatch.
    pub fn check_data_type(&self, res: &Resource) -> Result<(), String> {
        let (Some(expected), Some(data)) = (&self.data_type, &res.data) else {
            return Ok(());
        };
        let got = data
            .type_url
            .rsplit_once('/')
            .map(|(_, name)| name)
            .unwrap_or(data.type_url.as_str());
        if got == expected {
            Ok(())
        } else {
            Err(got.to_string())
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("resource_type", &type_string(&self.resource_type))
            .field("scope", &self.scope)
            .field("data_type", &self.data_type)
            .field("validate", &self.validate.is_some())
            .field("mutate", &self.mutate.is_some())
            .finish()
    }
}

/// Type registry keyed by `group.version.Kind`.
pub struct Registry {
    types: RwLock<HashMap<String, Registration>>,
    permissive: bool,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            permissive: false,
        }
    }

    /// A registry that resolves unknown types to a namespace scoped
    /// registration with no hooks.
    pub fn permissive() -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            permissive: true,
        }
    }

    pub fn register(&self, registration: Registration) -> Result<(), RegistryError> {
        let key = type_string(&registration.resource_type);
        let mut types = self.types.write();
        if types.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        debug!(resource_type = %key, "Registered resource type");
        types.insert(key, registration);
        Ok(())
    }

    pub fn resolve(&self, ty: &Type) -> Result<Registration, RegistryError> {
        let key = type_string(ty);
        if let Some(registration) = self.types.read().get(&key) {
            return Ok(registration.clone());
        }
        if self.permissive {
            return Ok(Registration::new(ty.clone()));
        }
        Err(RegistryError::NotRegistered(key))
    }

    pub fn types(&self) -> Vec<Type> {
        self.types
            .read()
            .values()
            .map(|r| r.resource_type.clone())
            .collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist_type() -> Type {
        Type {
            group: "demo".to_string(),
            group_version: "v2".to_string(),
            kind: "Artist".to_string(),
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = Registry::new();
        registry
            .register(Registration::new(artist_type()).with_scope(Scope::Partition))
            .unwrap();

        let reg = registry.resolve(&artist_type()).unwrap();
        assert_eq!(reg.scope, Scope::Partition);

        let err = registry
            .register(Registration::new(artist_type()))
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::AlreadyRegistered("demo.v2.Artist".to_string())
        );
    }

    #[test]
    fn test_resolve_unregistered() {
        let registry = Registry::new();
        let err = registry.resolve(&artist_type()).unwrap_err();
        assert_eq!(err.to_string(), "resource type demo.v2.Artist not registered");

        let permissive = Registry::permissive();
        assert!(permissive.resolve(&artist_type()).is_ok());
    }

    #[test]
    fn test_check_data_type() {
        let reg = Registration::new(artist_type()).with_data_type("demo.v2.Artist");
        let mut res = Resource {
            data: Some(prost_types::Any {
                type_url: "type.googleapis.com/demo.v2.Artist".to_string(),
                value: Vec::new(),
            }),
            ..Default::default()
        };
        assert!(reg.check_data_type(&res).is_ok());

        res.data = Some(prost_types::Any {
            type_url: "type.googleapis.com/demo.v2.Album".to_string(),
            value: Vec::new(),
        });
        assert_eq!(reg.check_data_type(&res), Err("demo.v2.Album".to_string()));
    }

    #[test]
    fn test_hooks() {
        let reg = Registration::new(artist_type())
            .with_mutate(|res| {
                res.metadata.insert("mutated".to_string(), "true".to_string());
                Ok(())
            })
            .with_validate(|res| {
                if res.metadata.contains_key("mutated") {
                    Ok(())
                } else {
                    Err("not mutated".to_string())
                }
            });

        let mut res = Resource::default();
        assert!(reg.run_validate(&res).is_err());
        reg.run_mutate(&mut res).unwrap();
        assert!(reg.run_validate(&res).is_ok());
    }
}
