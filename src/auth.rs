//! Authentication and role predicates (spec §6, design note "Authorization").
//!
//! A [`Principal`] is a plain `(user_id, roles)` pair, consumed by the
//! reconciler and the admin actions as predicates — never as a class
//! hierarchy. Basic auth carries the api-key as the username; the password
//! is ignored, matching the original source's token-as-username convention.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use sqlx::PgPool;

use crate::errors::AuthError;
use crate::models::{ROLE_ADMIN, ROLE_DEVELOPER, ROLE_PACKAGE_ADMIN};

#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: i32,
    pub username: String,
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    pub fn is_package_admin(&self) -> bool {
        self.has_role(ROLE_PACKAGE_ADMIN)
    }

    pub fn is_developer(&self) -> bool {
        self.has_role(ROLE_DEVELOPER)
    }

    /// Whether this principal may create or modify a package it does not
    /// already own outright: package admins and admins always can.
    pub fn can_administer_packages(&self) -> bool {
        self.is_admin() || self.is_package_admin()
    }
}

pub struct AppAuthState {
    pub pool: PgPool,
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    Arc<crate::http::AppState>: axum::extract::FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = Arc::<crate::http::AppState>::from_ref(state);

        let TypedHeader(Authorization(basic)): TypedHeader<Authorization<Basic>> =
            TypedHeader::from_request_parts(parts, state)
                .await
                .map_err(|_| AuthError::MissingKey)?;

        authenticate(&app_state.pool, basic.username()).await
    }
}

async fn authenticate(pool: &PgPool, api_key: &str) -> Result<Principal, AuthError> {
    let user = crate::db::find_user_by_api_key(pool, api_key)
        .await
        .map_err(|_| AuthError::InvalidKey)?
        .ok_or(AuthError::InvalidKey)?;
    let roles = crate::db::find_user_roles(pool, user.id)
        .await
        .map_err(|_| AuthError::InvalidKey)?
        .into_iter()
        .map(|r| r.name)
        .collect();

    Ok(Principal {
        user_id: user.id,
        username: user.username,
        roles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(roles: &[&str]) -> Principal {
        Principal {
            user_id: 1,
            username: "alice".to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    #[test]
    fn admin_can_administer_packages() {
        assert!(principal(&[ROLE_ADMIN]).can_administer_packages());
    }

    #[test]
    fn package_admin_can_administer_packages() {
        assert!(principal(&[ROLE_PACKAGE_ADMIN]).can_administer_packages());
    }

    #[test]
    fn plain_developer_cannot_administer_packages() {
        assert!(!principal(&[ROLE_DEVELOPER]).can_administer_packages());
    }

    #[test]
    fn has_role_is_exact_match() {
        let p = principal(&[ROLE_DEVELOPER]);
        assert!(p.has_role(ROLE_DEVELOPER));
        assert!(!p.has_role(ROLE_ADMIN));
    }
}
