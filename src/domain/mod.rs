// Domain layer: models, region data and ports (interfaces) for external collaborators.

pub mod model;
pub mod ports;
pub mod region;
