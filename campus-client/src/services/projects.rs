use std::time::Duration;

use campus_core::{NewProject, Project, ProjectFilters, ProjectUpdate};

use super::{Resource, ResourceService};

/// Collaboration listings.
#[derive(Debug, Clone, Copy)]
pub struct Projects;

impl Resource for Projects {
    const NAME: &'static str = "projects";
    const PATH: &'static str = "/api/projects";
    const TTL: Duration = Duration::from_secs(5 * 60);

    type Entity = Project;
    type Filters = ProjectFilters;
    type Create = NewProject;
    type Update = ProjectUpdate;
}

pub type ProjectsService = ResourceService<Projects>;
