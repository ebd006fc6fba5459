//! Instrumentation manager implementation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::InstrumentationError;
use super::table::CounterTable;

/// Location and names of the probe pieces inside the compiled object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Path to the compiled instrumentation object.
    pub object_path: PathBuf,
    /// Program to attach.
    pub entry_point: String,
    /// Map the program writes its counts into.
    pub table_name: String,
    /// Kernel function the program is attached to.
    pub attach_symbol: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            object_path: PathBuf::from("/bpf/tcpconnect.bpf.o"),
            entry_point: "on_tcp_connect".to_string(),
            table_name: "counts".to_string(),
            attach_symbol: "tcp_connect".to_string(),
        }
    }
}

/// Loads instrumentation objects.
pub trait ProbeBackend {
    type Object: ProbeObject;

    fn load(&self, path: &Path) -> Result<Self::Object, InstrumentationError>;
}

/// A loaded instrumentation object and the kernel resources it owns.
pub trait ProbeObject: Send + 'static {
    /// Attachment of a program to a kernel symbol.
    type Link: Send + 'static;
    /// Counter table exposed by the object.
    type Table: CounterTable + 'static;

    fn has_entry_point(&self, name: &str) -> bool;

    fn attach(
        &mut self,
        entry_point: &str,
        symbol: &str,
    ) -> Result<Self::Link, InstrumentationError>;

    fn take_table(&mut self, name: &str) -> Option<Self::Table>;

    fn detach(&mut self, link: Self::Link) -> Result<(), InstrumentationError>;

    /// Release the object and everything it still owns.
    fn close(self) -> Result<(), InstrumentationError>;
}

/// Resources acquired so far. Any field may be unset when acquisition
/// failed part way.
struct InstrumentationHandle<O: ProbeObject> {
    object: Option<O>,
    link: Option<O::Link>,
    table: Option<Arc<O::Table>>,
}

impl<O: ProbeObject> InstrumentationHandle<O> {
    fn acquire(&mut self, config: &ProbeConfig) -> Result<Arc<O::Table>, InstrumentationError> {
        let Some(object) = self.object.as_mut() else {
            return Err(InstrumentationError::Release(
                "instrumentation object already released".to_string(),
            ));
        };

        if !object.has_entry_point(&config.entry_point) {
            return Err(InstrumentationError::EntryPointNotFound(
                config.entry_point.clone(),
            ));
        }

        self.link = Some(object.attach(&config.entry_point, &config.attach_symbol)?);
        debug!(
            entry_point = %config.entry_point,
            symbol = %config.attach_symbol,
            "Instrumentation attached"
        );

        let table = object
            .take_table(&config.table_name)
            .map(Arc::new)
            .ok_or_else(|| InstrumentationError::TableNotFound(config.table_name.clone()))?;
        self.table = Some(table.clone());

        Ok(table)
    }

    /// Release link, table and object in that order. Every release is
    /// attempted; the first error wins.
    fn close(&mut self) -> Result<(), InstrumentationError> {
        let mut first_error = None;

        if let Some(link) = self.link.take() {
            let detached = match self.object.as_mut() {
                Some(object) => object.detach(link),
                None => Err(InstrumentationError::Detach(
                    "link outlived its instrumentation object".to_string(),
                )),
            };
            if let Err(e) = detached {
                first_error.get_or_insert(e);
            }
        }

        if let Some(table) = self.table.take() {
            table.release();
        }

        if let Some(object) = self.object.take()
            && let Err(e) = object.close()
        {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.object.is_none() && self.link.is_none() && self.table.is_none()
    }
}

impl<O: ProbeObject> Drop for InstrumentationHandle<O> {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Instrumentation handle dropped without close, releasing");
            if let Err(e) = self.close() {
                warn!(error = %e, "Failed to release instrumentation on drop");
            }
        }
    }
}

/// Owns a loaded and attached instrumentation object.
pub struct InstrumentationManager<O: ProbeObject> {
    config: ProbeConfig,
    handle: InstrumentationHandle<O>,
    counters: Arc<O::Table>,
}

impl<O: ProbeObject> InstrumentationManager<O> {
    /// Load the object, attach its entry point and locate its counter table.
    ///
    /// On failure, whatever was already acquired is released before the
    /// error is returned.
    pub fn open<B>(backend: &B, config: ProbeConfig) -> Result<Self, InstrumentationError>
    where
        B: ProbeBackend<Object = O>,
    {
        let object = backend.load(&config.object_path)?;
        let mut handle = InstrumentationHandle {
            object: Some(object),
            link: None,
            table: None,
        };

        match handle.acquire(&config) {
            Ok(counters) => {
                info!(
                    object = %config.object_path.display(),
                    entry_point = %config.entry_point,
                    symbol = %config.attach_symbol,
                    table = %config.table_name,
                    "Instrumentation loaded and attached"
                );
                Ok(Self {
                    config,
                    handle,
                    counters,
                })
            }
            Err(err) => {
                if let Err(e) = handle.close() {
                    warn!(error = %e, "Failed to release partially acquired instrumentation");
                }
                Err(err)
            }
        }
    }

    /// Counter table populated by the attached program.
    pub fn counters(&self) -> Arc<dyn CounterTable> {
        self.counters.clone()
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Detach the program and release the object. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<(), InstrumentationError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        let result = self.handle.close();
        match &result {
            Ok(()) => info!(symbol = %self.config.attach_symbol, "Instrumentation detached"),
            Err(e) => warn!(error = %e, "Instrumentation released with errors"),
        }
        result
    }
}
