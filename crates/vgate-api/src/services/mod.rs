//! Background services.

pub mod health_monitor;

pub use health_monitor::{
    HealthMonitor, HealthProbe, HttpProbe, ProbeOutcome, SupervisorProbe, WorkerCheck,
    WorkerRestarter,
};
