use crate::service::EnvService;

#[derive(Clone)]
pub struct AppState {
    pub service: EnvService,
}
