use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::documents::ManualGenerator;
use crate::membership::{MembershipRepository, MembershipService};
use crate::shutdown::BackgroundServices;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub membership: MembershipService,
    pub background: BackgroundServices,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        repo: Arc<dyn MembershipRepository>,
        background: BackgroundServices,
    ) -> Self {
        let membership = MembershipService::new(
            repo,
            background.spawner.clone(),
            background.mailer.clone(),
            ManualGenerator::new(settings.documents.tmp_dir.clone()),
            background.shutdown.clone(),
        );

        Self {
            settings: Arc::new(settings),
            membership,
            background,
            start_time: Instant::now(),
        }
    }
}
