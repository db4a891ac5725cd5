//! Per-entity create/get/list/update/delete operations plus the named
//! queries the component design calls out explicitly.

pub mod chapters;
pub mod characters;
pub mod plot_arcs;
pub mod projects;
pub mod style_profiles;
pub mod volumes;
pub mod world_items;

pub use chapters::ChapterRepository;
pub use characters::CharacterRepository;
pub use plot_arcs::PlotArcRepository;
pub use projects::ProjectRepository;
pub use style_profiles::StyleProfileRepository;
pub use volumes::VolumeRepository;
pub use world_items::WorldItemRepository;
