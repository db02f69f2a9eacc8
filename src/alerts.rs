use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// Alert level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// An operator-facing alert. `Critical` alerts mark conditions that need
/// manual intervention (reconciliation mismatch, stuck close, lost record).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Ring buffer of recent alerts plus immediate leveled logging. Callbacks let
/// a deployment wire alerts into paging without the engine knowing about it.
pub struct AlertManager {
    alerts: RwLock<VecDeque<Alert>>,
    max_alerts: usize,
    callbacks: RwLock<Vec<Box<dyn Fn(&Alert) + Send + Sync>>>,
}

impl AlertManager {
    pub fn new(max_alerts: usize) -> Arc<Self> {
        Arc::new(Self {
            alerts: RwLock::new(VecDeque::new()),
            max_alerts,
            callbacks: RwLock::new(Vec::new()),
        })
    }

    /// Emit an alert
    pub fn emit(&self, level: AlertLevel, component: &str, message: impl Into<String>) {
        let alert = Alert {
            level,
            component: component.to_string(),
            message: message.into(),
            at: Utc::now(),
        };

        {
            let mut alerts = self.alerts.write().expect("alert buffer poisoned");
            alerts.push_back(alert.clone());
            while alerts.len() > self.max_alerts {
                alerts.pop_front();
            }
        }

        {
            let callbacks = self.callbacks.read().expect("alert callbacks poisoned");
            for callback in callbacks.iter() {
                callback(&alert);
            }
        }

        match level {
            AlertLevel::Info => log::info!("[{}] {}", alert.component, alert.message),
            AlertLevel::Warning => log::warn!("[{}] {}", alert.component, alert.message),
            AlertLevel::Error => log::error!("[{}] {}", alert.component, alert.message),
            AlertLevel::Critical => {
                log::error!("[CRITICAL] [{}] {}", alert.component, alert.message)
            }
        }
    }

    /// Register an alert callback
    pub fn register_callback<F>(&self, callback: F)
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .expect("alert callbacks poisoned")
            .push(Box::new(callback));
    }

    /// Most recent alerts, newest first.
    pub fn recent(&self, count: usize) -> Vec<Alert> {
        let alerts = self.alerts.read().expect("alert buffer poisoned");
        alerts.iter().rev().take(count).cloned().collect()
    }

    pub fn by_level(&self, level: AlertLevel) -> Vec<Alert> {
        let alerts = self.alerts.read().expect("alert buffer poisoned");
        alerts.iter().filter(|a| a.level == level).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ring_buffer_caps_alerts() {
        let manager = AlertManager::new(2);
        manager.emit(AlertLevel::Info, "test", "one");
        manager.emit(AlertLevel::Info, "test", "two");
        manager.emit(AlertLevel::Info, "test", "three");

        let recent = manager.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "three");
        assert_eq!(recent[1].message, "two");
    }

    #[test]
    fn test_callbacks_fire() {
        let manager = AlertManager::new(10);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        manager.register_callback(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        manager.emit(AlertLevel::Critical, "positions", "stuck closing");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_filter_by_level() {
        let manager = AlertManager::new(10);
        manager.emit(AlertLevel::Info, "a", "x");
        manager.emit(AlertLevel::Critical, "b", "y");

        let critical = manager.by_level(AlertLevel::Critical);
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].component, "b");
    }
}
