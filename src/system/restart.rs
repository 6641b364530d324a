use tracing::error;

use super::Restarter;

/// Exits the process; the service manager brings the gateway back up
pub struct ProcessRestart {
    exit_code: i32,
}

impl ProcessRestart {
    pub fn new(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

impl Restarter for ProcessRestart {
    fn restart(&self) {
        error!("Restarting gateway (exit code {})", self.exit_code);
        std::process::exit(self.exit_code);
    }
}
