//! # Transform Events Module
//!
//! Punti di registrazione espliciti per gli observer del sottosistema.
//!
//! ## Hook disponibili:
//! - `before_save` / `before_delete`: possono bloccare l'operazione restituendo `Err(motivo)`
//! - `after_save` / `after_delete`: notifiche dopo l'applicazione della modifica
//! - `on_generate`: può fornire un file già renderizzato, saltando il render interno
//!
//! Il registro è clonabile e condiviso tra store delle definizioni e pipeline.

use crate::error::{Result, TransformError};
use crate::index::record::{Asset, TransformIndex};
use crate::transform::definition::TransformDefinition;
use crate::transform::spec::TransformSpec;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

/// Payload of definition hooks
#[derive(Debug)]
pub struct DefinitionEvent<'a> {
    pub definition: &'a TransformDefinition,
    pub is_new: bool,
}

/// Payload of the generate hook
#[derive(Debug)]
pub struct GenerateEvent<'a> {
    pub asset: &'a Asset,
    pub index: &'a TransformIndex,
    pub spec: &'a TransformSpec,
    pub format: &'a str,
}

pub type VetoHook = Arc<dyn Fn(&DefinitionEvent<'_>) -> std::result::Result<(), String> + Send + Sync>;
pub type NotifyHook = Arc<dyn Fn(&DefinitionEvent<'_>) + Send + Sync>;
pub type GenerateHook = Arc<dyn Fn(&GenerateEvent<'_>) -> Option<PathBuf> + Send + Sync>;

#[derive(Default)]
struct Hooks {
    before_save: Vec<VetoHook>,
    after_save: Vec<NotifyHook>,
    before_delete: Vec<VetoHook>,
    after_delete: Vec<NotifyHook>,
    on_generate: Vec<GenerateHook>,
}

/// Observer registry shared by the definition store and the pipeline
#[derive(Clone, Default)]
pub struct TransformEvents {
    hooks: Arc<RwLock<Hooks>>,
}

impl TransformEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_save<F>(&self, hook: F)
    where
        F: Fn(&DefinitionEvent<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.write().before_save.push(Arc::new(hook));
    }

    pub fn on_after_save<F>(&self, hook: F)
    where
        F: Fn(&DefinitionEvent<'_>) + Send + Sync + 'static,
    {
        self.write().after_save.push(Arc::new(hook));
    }

    pub fn on_before_delete<F>(&self, hook: F)
    where
        F: Fn(&DefinitionEvent<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.write().before_delete.push(Arc::new(hook));
    }

    pub fn on_after_delete<F>(&self, hook: F)
    where
        F: Fn(&DefinitionEvent<'_>) + Send + Sync + 'static,
    {
        self.write().after_delete.push(Arc::new(hook));
    }

    /// Register a generator; the first one returning a path wins
    pub fn on_generate<F>(&self, hook: F)
    where
        F: Fn(&GenerateEvent<'_>) -> Option<PathBuf> + Send + Sync + 'static,
    {
        self.write().on_generate.push(Arc::new(hook));
    }

    pub(crate) fn before_save(&self, event: &DefinitionEvent<'_>) -> Result<()> {
        let hooks = self.read().before_save.clone();
        run_vetoes(&hooks, event)
    }

    pub(crate) fn after_save(&self, event: &DefinitionEvent<'_>) {
        let hooks = self.read().after_save.clone();
        hooks.iter().for_each(|hook| hook(event));
    }

    pub(crate) fn before_delete(&self, event: &DefinitionEvent<'_>) -> Result<()> {
        let hooks = self.read().before_delete.clone();
        run_vetoes(&hooks, event)
    }

    pub(crate) fn after_delete(&self, event: &DefinitionEvent<'_>) {
        let hooks = self.read().after_delete.clone();
        hooks.iter().for_each(|hook| hook(event));
    }

    pub(crate) fn generate(&self, event: &GenerateEvent<'_>) -> Option<PathBuf> {
        let hooks = self.read().on_generate.clone();
        hooks.iter().find_map(|hook| hook(event))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Hooks> {
        self.hooks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Hooks> {
        self.hooks.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_vetoes(hooks: &[VetoHook], event: &DefinitionEvent<'_>) -> Result<()> {
    for hook in hooks {
        hook(event).map_err(TransformError::Vetoed)?;
    }
    Ok(())
}
