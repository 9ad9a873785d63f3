use serde::Serialize;

use crate::error::{LmsError, LmsResult};
use crate::models::{Role, User};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    TakeCourses,
    ManageContent,
    ManageEnrollments,
    ViewAnalytics,
}

/// Explicit permission set resolved for a user.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub take_courses: bool,
    pub manage_content: bool,
    pub manage_enrollments: bool,
    pub view_analytics: bool,
}

impl Capabilities {
    pub fn allows(&self, perm: Permission) -> bool {
        match perm {
            Permission::TakeCourses => self.take_courses,
            Permission::ManageContent => self.manage_content,
            Permission::ManageEnrollments => self.manage_enrollments,
            Permission::ViewAnalytics => self.view_analytics,
        }
    }
}

pub fn capabilities(user: &User) -> Capabilities {
    let staff = user.is_superuser
        || matches!(user.role, Role::Admin | Role::HeadOfRisk | Role::RiskComplianceSpecialist);
    Capabilities {
        take_courses: true,
        manage_content: staff,
        manage_enrollments: staff,
        view_analytics: staff,
    }
}

pub fn require(user: &User, perm: Permission) -> LmsResult<()> {
    if capabilities(user).allows(perm) {
        return Ok(());
    }
    tracing::warn!(user_id = %user.id, role = user.role.as_str(), ?perm, "permission denied");
    Err(LmsError::Forbidden)
}
