//! Service discovery from `.proto` files.
//!
//! The bridge only needs the service surface of a protocol definition:
//! the package, every `service` block and the `rpc` names inside it.
//! Files are compiled with `protox`, so imports and type references must
//! resolve, but messages are never used past that point: payloads stay
//! encoded end to end.

use std::path::{Path, PathBuf};

use crate::{BifrostError, Result};

/// One service declared in a protocol definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub package: String,
    pub name: String,
    pub methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// `package.Service`, or just `Service` when no package is declared.
    pub fn qualified_name(&self) -> String {
        if self.package.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.package, self.name)
        }
    }
}

/// One `rpc` of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub name: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl MethodDescriptor {
    pub fn is_unary(&self) -> bool {
        !self.client_streaming && !self.server_streaming
    }

    pub fn is_streaming(&self) -> bool {
        !self.is_unary()
    }
}

/// Source of service descriptors.
pub trait ProtocolRegistry: Send + Sync {
    fn services(&self, path: &Path) -> Result<Vec<ServiceDescriptor>>;
}

/// Compiles a `.proto` file and lists the services it declares.
///
/// Imports resolve against the file's own directory, the configured
/// include paths and the bundled `google/protobuf` files. Services of
/// imported files are not exposed.
#[derive(Debug, Clone, Default)]
pub struct ProtoFileRegistry {
    includes: Vec<PathBuf>,
}

impl ProtoFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra directories searched for imports.
    pub fn with_includes(includes: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            includes: includes.into_iter().collect(),
        }
    }
}

impl ProtocolRegistry for ProtoFileRegistry {
    fn services(&self, path: &Path) -> Result<Vec<ServiceDescriptor>> {
        let protocol_error = |message: String| BifrostError::Protocol {
            path: path.display().to_string(),
            message,
        };

        let root = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| protocol_error("not a file path".into()))?;

        let includes = std::iter::once(root.clone()).chain(self.includes.iter().cloned());
        let mut compiler = protox::Compiler::new(includes).map_err(|e| protocol_error(e.to_string()))?;
        compiler
            .open_file(root.join(name))
            .map_err(|e| protocol_error(e.to_string()))?;

        let pool = compiler.descriptor_pool();
        let file = pool
            .get_file_by_name(name)
            .ok_or_else(|| protocol_error(format!("{name} missing from compiled descriptors")))?;
        Ok(file.services().map(|service| describe(&service)).collect())
    }
}

fn describe(service: &prost_reflect::ServiceDescriptor) -> ServiceDescriptor {
    ServiceDescriptor {
        package: service.package_name().to_string(),
        name: service.name().to_string(),
        methods: service
            .methods()
            .map(|method| MethodDescriptor {
                name: method.name().to_string(),
                client_streaming: method.is_client_streaming(),
                server_streaming: method.is_server_streaming(),
            })
            .collect(),
    }
}
