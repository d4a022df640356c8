//! Resource and rule states

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by sources, devices, targets and cecollas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ResourceState {
    Down = 0,
    Up = 1,
    Pause = 2,
    Stop = 3,
    Pending = 4,
}

impl From<ResourceState> for u8 {
    fn from(state: ResourceState) -> Self {
        state as u8
    }
}

impl TryFrom<u8> for ResourceState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Down),
            1 => Ok(Self::Up),
            2 => Ok(Self::Pause),
            3 => Ok(Self::Stop),
            4 => Ok(Self::Pending),
            other => Err(format!("invalid resource state: {}", other)),
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Down => "DOWN",
            Self::Up => "UP",
            Self::Pause => "PAUSE",
            Self::Stop => "STOP",
            Self::Pending => "PENDING",
        };
        f.write_str(s)
    }
}

/// Lock-free cell holding a [`ResourceState`]
#[derive(Debug)]
pub struct StateCell(std::sync::atomic::AtomicU8);

impl StateCell {
    pub fn new(state: ResourceState) -> Self {
        Self(std::sync::atomic::AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ResourceState {
        ResourceState::try_from(self.0.load(std::sync::atomic::Ordering::Acquire))
            .unwrap_or(ResourceState::Down)
    }

    pub fn set(&self, state: ResourceState) {
        self.0.store(state as u8, std::sync::atomic::Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ResourceState::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RuleStatus {
    Stop = 0,
    Running = 1,
}

impl From<RuleStatus> for u8 {
    fn from(status: RuleStatus) -> Self {
        status as u8
    }
}

impl TryFrom<u8> for RuleStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Stop),
            1 => Ok(Self::Running),
            other => Err(format!("invalid rule status: {}", other)),
        }
    }
}
