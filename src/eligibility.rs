//! Eligibility checks that gate whether a revision may be tested.
//!
//! Checks run in a fixed order and the first failing one is reported:
//!
//! 1. change request is mergeable
//! 2. there is at least one commit
//! 3. change request is not closed
//! 4. trigger comment (when configured) exists and is not older than the last commit
//! 5. the author passes the whitelist
//!
//! Branch revisions have no author and no comments, so only check 2 applies
//! to them.

use std::fmt;

use crate::error::{Error, Result};
use crate::hosting::HostingClient;
use crate::revision::{ChangeRequest, ChangeState, Revision};

/// Why a revision was not scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IneligibleReason {
    NotMergeable,
    NoCommits,
    Closed,
    MissingTrigger,
    StaleTrigger,
    NotAuthorized { author: String },
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IneligibleReason::NotMergeable => write!(f, "not mergeable"),
            IneligibleReason::NoCommits => write!(f, "no commits"),
            IneligibleReason::Closed => write!(f, "closed"),
            IneligibleReason::MissingTrigger => write!(f, "missing trigger comment"),
            IneligibleReason::StaleTrigger => write!(f, "stale trigger"),
            IneligibleReason::NotAuthorized { author } => {
                write!(f, "author not authorized: {}", author)
            }
        }
    }
}

/// Who may have their change requests tested.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Whitelist {
    /// `*`: anyone.
    #[default]
    Anyone,
    /// `@`: members of the repository owner's organization.
    OrgMembers,
    /// Comma-separated literal logins.
    Users(Vec<String>),
}

impl Whitelist {
    /// Parses a whitelist expression.
    ///
    /// An empty expression means anyone. `*` and `@` must appear alone.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        match expression {
            "" | "*" => return Ok(Whitelist::Anyone),
            "@" => return Ok(Whitelist::OrgMembers),
            _ => {}
        }

        let users: Vec<String> = expression
            .split(',')
            .map(|login| login.trim().to_string())
            .filter(|login| !login.is_empty())
            .collect();

        if users.iter().any(|login| login == "*" || login == "@") {
            return Err(Error::Config(format!(
                "whitelist '{}' mixes '*' or '@' with logins",
                expression
            )));
        }

        if users.is_empty() {
            return Err(Error::Config(format!(
                "whitelist '{}' contains no logins",
                expression
            )));
        }

        Ok(Whitelist::Users(users))
    }

    /// Decides admission for `author` without consulting the platform.
    ///
    /// Returns `None` when the answer depends on organization membership.
    pub fn admits_locally(&self, author: &str) -> Option<bool> {
        match self {
            Whitelist::Anyone => Some(true),
            Whitelist::Users(users) => Some(users.iter().any(|login| login == author)),
            Whitelist::OrgMembers => None,
        }
    }
}

/// Repository-level eligibility settings.
#[derive(Debug, Clone, Default)]
pub struct EligibilityPolicy {
    /// Whether a trigger comment is required.
    pub trigger_required: bool,
    /// Author whitelist.
    pub whitelist: Whitelist,
}

/// Outcome of the eligibility state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(IneligibleReason),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Runs checks 1-4 and the non-membership whitelist forms.
///
/// `org_member` supplies the membership answer for `@` whitelists; when it is
/// `None` under `@`, the author is treated as not authorized.
pub fn evaluate(
    revision: &Revision,
    policy: &EligibilityPolicy,
    org_member: Option<bool>,
) -> Eligibility {
    match revision {
        Revision::Branch(_) => {
            if revision.commits().is_empty() {
                Eligibility::Ineligible(IneligibleReason::NoCommits)
            } else {
                Eligibility::Eligible
            }
        }
        Revision::ChangeRequest(cr) => evaluate_change_request(cr, policy, org_member),
    }
}

fn evaluate_change_request(
    cr: &ChangeRequest,
    policy: &EligibilityPolicy,
    org_member: Option<bool>,
) -> Eligibility {
    use IneligibleReason::*;

    if !cr.mergeable() {
        return Eligibility::Ineligible(NotMergeable);
    }

    let Some(latest) = cr.latest_commit() else {
        return Eligibility::Ineligible(NoCommits);
    };

    if cr.state() == ChangeState::Closed {
        return Eligibility::Ineligible(Closed);
    }

    if policy.trigger_required {
        match cr.trigger() {
            None => return Eligibility::Ineligible(MissingTrigger),
            // Second granularity; an equal timestamp still counts as fresh.
            Some(trigger) if trigger.created_at.timestamp() < latest.timestamp.timestamp() => {
                return Eligibility::Ineligible(StaleTrigger);
            }
            Some(_) => {}
        }
    }

    let admitted = policy
        .whitelist
        .admits_locally(cr.author())
        .or(org_member)
        .unwrap_or(false);

    if !admitted {
        return Eligibility::Ineligible(NotAuthorized {
            author: cr.author().to_string(),
        });
    }

    Eligibility::Eligible
}

/// Full eligibility check, asking the platform about organization membership
/// only when every other check has passed.
pub async fn check(
    revision: &Revision,
    policy: &EligibilityPolicy,
    client: &dyn HostingClient,
) -> Result<Eligibility> {
    let first_pass = evaluate(revision, policy, None);

    let Revision::ChangeRequest(cr) = revision else {
        return Ok(first_pass);
    };

    match (&first_pass, &policy.whitelist) {
        (Eligibility::Ineligible(IneligibleReason::NotAuthorized { .. }), Whitelist::OrgMembers) => {
            let member = client.is_org_member(cr.author()).await?;
            Ok(evaluate(revision, policy, Some(member)))
        }
        _ => Ok(first_pass),
    }
}
