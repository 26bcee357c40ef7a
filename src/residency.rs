//! # Accelerator memory residency
//!
//! The three sub-models do not have to fit on the accelerator at the same
//! time: each one is only needed during its phase of the pipeline. The
//! [`ResidencyManager`] moves sub-models to the accelerator when they are
//! acquired and back to host memory when they are released or when room is
//! needed for another sub-model, keeping the accounted usage within a budget.
use std::time::{Duration, Instant};

use tch::Device;

use crate::config::ResidencyPolicy;
use crate::error::Error;
use crate::submodel::SubModelKind;

/// Something that can live either in host or in accelerator memory.
pub trait Resident {
    /// Bytes taken by the weights, wherever they currently are.
    fn footprint_bytes(&self) -> u64;
    /// The device this sub-model computes on.
    fn target_device(&self) -> Device;
    fn current_device(&self) -> Device;
    fn move_to(&mut self, device: Device) -> anyhow::Result<()>;
}

/// Gives access to the sub-models by kind.
pub trait ResidentSet {
    fn resident_mut(&mut self, kind: SubModelKind) -> &mut dyn Resident;
}

/// Reports how much accelerator memory is in use, when the backend can tell.
pub trait MemoryProbe {
    fn allocated_bytes(&self, device: Device) -> Option<u64>;
}

/// A probe that never knows; evictions are then considered done as soon as
/// the move returns.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProbe;

impl MemoryProbe for NoProbe {
    fn allocated_bytes(&self, _device: Device) -> Option<u64> {
        None
    }
}

/// How long to wait for memory to be handed back after an eviction.
#[derive(Debug, Clone, Copy)]
pub struct EvictionWait {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for EvictionWait {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(100), timeout: Duration::from_secs(30) }
    }
}

pub struct ResidencyManager {
    accelerator: Device,
    budget: Option<u64>,
    policy: ResidencyPolicy,
    probe: Box<dyn MemoryProbe>,
    wait: EvictionWait,
    // Sub-models on the accelerator with their accounted size, least recently
    // used first.
    resident: Vec<(SubModelKind, u64)>,
}

impl std::fmt::Debug for ResidencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidencyManager")
            .field("accelerator", &self.accelerator)
            .field("budget", &self.budget)
            .field("policy", &self.policy)
            .field("resident", &self.resident)
            .finish()
    }
}

impl ResidencyManager {
    pub fn new(accelerator: Device, budget: Option<u64>, policy: ResidencyPolicy) -> Self {
        Self {
            accelerator,
            budget,
            policy,
            probe: Box::new(NoProbe),
            wait: EvictionWait::default(),
            resident: vec![],
        }
    }

    pub fn with_probe<P: MemoryProbe + 'static>(mut self, probe: P) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_wait(mut self, wait: EvictionWait) -> Self {
        self.wait = wait;
        self
    }

    /// Accounted bytes currently on the accelerator.
    pub fn resident_bytes(&self) -> u64 {
        self.resident.iter().map(|(_, bytes)| bytes).sum()
    }

    pub fn is_resident(&self, kind: SubModelKind) -> bool {
        self.resident.iter().any(|(k, _)| *k == kind)
    }

    /// Kinds on the accelerator, least recently used first.
    pub fn resident_kinds(&self) -> Vec<SubModelKind> {
        self.resident.iter().map(|(k, _)| *k).collect()
    }

    /// Makes sure a sub-model is on its compute device, evicting others if
    /// the budget requires it.
    pub fn acquire<S: ResidentSet + ?Sized>(
        &mut self,
        set: &mut S,
        kind: SubModelKind,
    ) -> anyhow::Result<()> {
        let target = set.resident_mut(kind).target_device();
        if target == Device::Cpu {
            return Ok(());
        }
        if let Some(pos) = self.resident.iter().position(|(k, _)| *k == kind) {
            let entry = self.resident.remove(pos);
            self.resident.push(entry);
            return Ok(());
        }
        let needed = set.resident_mut(kind).footprint_bytes();
        if let Some(budget) = self.budget {
            if needed > budget {
                return Err(Error::ExceedsBudget { kind, needed, budget }.into());
            }
            while self.resident_bytes() + needed > budget {
                let (victim, _) = self.resident[0];
                tracing::info!("evicting {victim} to make room for {kind}");
                self.evict(set, victim)?;
            }
        }
        tracing::info!("moving {kind} to {target:?} ({} MB)", needed / 1_000_000);
        set.resident_mut(kind).move_to(target)?;
        self.resident.push((kind, needed));
        Ok(())
    }

    /// Signals that a phase is done with a sub-model.
    pub fn release<S: ResidentSet + ?Sized>(
        &mut self,
        set: &mut S,
        kind: SubModelKind,
    ) -> anyhow::Result<()> {
        match self.policy {
            ResidencyPolicy::LowVram if self.is_resident(kind) => self.evict(set, kind),
            _ => Ok(()),
        }
    }

    /// Moves every sub-model back to host memory.
    pub fn release_all<S: ResidentSet + ?Sized>(&mut self, set: &mut S) -> anyhow::Result<()> {
        for kind in self.resident_kinds() {
            self.evict(set, kind)?;
        }
        Ok(())
    }

    /// Accelerator memory in use as reported by the probe, the accounted
    /// bytes when the probe cannot tell.
    pub fn memory_in_use(&self) -> u64 {
        self.probe.allocated_bytes(self.accelerator).unwrap_or_else(|| self.resident_bytes())
    }

    /// Ends a run: every sub-model goes back to host memory, whether the run
    /// succeeded or not. An error of the run takes precedence over one hit
    /// while releasing.
    pub fn finish<S: ResidentSet + ?Sized, T>(
        &mut self,
        set: &mut S,
        result: anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        tracing::info!("memory_final = {} MB", self.memory_in_use() / 1_000_000);
        let released = self.release_all(set);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), released) => {
                if let Err(release_err) = released {
                    tracing::warn!("error releasing sub-models: {release_err:#}");
                }
                Err(err)
            }
        }
    }

    fn evict<S: ResidentSet + ?Sized>(
        &mut self,
        set: &mut S,
        kind: SubModelKind,
    ) -> anyhow::Result<()> {
        let before = self.probe.allocated_bytes(self.accelerator);
        set.resident_mut(kind).move_to(Device::Cpu)?;
        self.resident.retain(|(k, _)| *k != kind);
        if let Some(before) = before {
            self.wait_for_release(kind, before)?;
        }
        tracing::debug!("{kind} evicted, {} MB accounted", self.resident_bytes() / 1_000_000);
        Ok(())
    }

    fn wait_for_release(&self, kind: SubModelKind, before: u64) -> crate::error::Result<()> {
        let start = Instant::now();
        loop {
            match self.probe.allocated_bytes(self.accelerator) {
                Some(now) if now >= before => {}
                _ => return Ok(()),
            }
            let waited = start.elapsed();
            if waited >= self.wait.timeout {
                return Err(Error::EvictionTimeout { kind, waited });
            }
            std::thread::sleep(self.wait.poll_interval);
        }
    }
}
