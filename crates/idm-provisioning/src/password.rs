//! Password change fan-out across an entity's accounts.

use std::collections::HashMap;

use chrono::Utc;
use idm_connector::{AttributeValue, ConnectorAttribute, ConnectorObject, OperationType};
use idm_core::{AccountId, SystemId};
use idm_secrets::GuardedString;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::lookup::CachedLookup;
use crate::mapping::{AttributeMapping, SystemMapping};
use crate::model::{Account, ProvisioningEntity, System};
use crate::operation::{
    AccountObject, AttributeKey, OperationResult, OperationState, ProvisioningOperation,
};
use crate::service::ProvisioningService;

/// Result code of an account whose password was changed.
pub const ACCOUNT_SUCCESS_CODE: &str = "PASSWORD_CHANGE_ACCOUNT_SUCCESS";

/// Result code of an account whose password change failed.
pub const ACCOUNT_FAILED_CODE: &str = "PASSWORD_CHANGE_ACCOUNT_FAILED";

/// Result code of an account without a password attribute.
pub const NO_PASSWORD_ATTRIBUTE_CODE: &str = "PASSWORD_CHANGE_NO_PASSWORD_ATTRIBUTE";

/// A password change for one entity.
#[derive(Debug, Clone)]
pub struct PasswordChangeRequest {
    /// The new password.
    pub new_password: GuardedString,
    /// Accounts to change; `None` means every account whose system supports
    /// password change.
    pub accounts: Option<Vec<AccountId>>,
}

impl PasswordChangeRequest {
    /// Change the password on every eligible account.
    pub fn all(new_password: impl Into<GuardedString>) -> Self {
        Self {
            new_password: new_password.into(),
            accounts: None,
        }
    }

    /// Change the password on the given accounts only.
    pub fn for_accounts(new_password: impl Into<GuardedString>, accounts: Vec<AccountId>) -> Self {
        Self {
            new_password: new_password.into(),
            accounts: Some(accounts),
        }
    }
}

/// Outcome of a password change on one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountOperationResult {
    pub account_id: AccountId,
    pub system_id: SystemId,
    pub uid: String,
    pub result: OperationResult,
}

impl AccountOperationResult {
    fn new(account: &Account, state: OperationState, code: &str) -> Self {
        Self {
            account_id: account.id,
            system_id: account.system_id,
            uid: account.uid.clone(),
            result: OperationResult::new(state, code),
        }
    }
}

/// Fans one password change out to accounts and password attributes.
pub struct PasswordChangeOrchestrator<'a> {
    service: &'a ProvisioningService,
    systems: CachedLookup<SystemId, System>,
}

impl<'a> PasswordChangeOrchestrator<'a> {
    /// Create an orchestrator over the service's collaborators.
    pub fn new(service: &'a ProvisioningService) -> Self {
        Self {
            service,
            systems: CachedLookup::new(),
        }
    }

    /// Change the password of `entity`'s accounts.
    ///
    /// Every account is handled independently: a failing account is
    /// reported and the others proceed.
    #[instrument(skip(self, entity, request), fields(entity_id = %entity.id))]
    pub async fn change_password(
        &self,
        entity: &ProvisioningEntity,
        request: PasswordChangeRequest,
    ) -> ProvisioningResult<Vec<AccountOperationResult>> {
        let accounts = self.candidates(entity, request.accounts.as_deref()).await?;
        info!(accounts = accounts.len(), "Changing password");

        let mut results: Vec<AccountOperationResult> = Vec::new();
        let mut index: HashMap<AccountId, usize> = HashMap::new();
        for mut account in accounts {
            let outcome = match self
                .change_account(&mut account, entity, &request.new_password)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(account_id = %account.id, error = %e, "Password change failed");
                    let mut failed = AccountOperationResult::new(
                        &account,
                        OperationState::Exception,
                        ACCOUNT_FAILED_CODE,
                    );
                    failed.result.cause = Some(e.to_string());
                    failed
                }
            };
            match index.get(&outcome.account_id) {
                Some(&at) => {
                    if merge_states(results[at].result.state, outcome.result.state)
                        == outcome.result.state
                    {
                        results[at] = outcome;
                    }
                }
                None => {
                    index.insert(outcome.account_id, results.len());
                    results.push(outcome);
                }
            }
        }
        Ok(results)
    }

    async fn candidates(
        &self,
        entity: &ProvisioningEntity,
        explicit: Option<&[AccountId]>,
    ) -> ProvisioningResult<Vec<Account>> {
        let accounts = &self.service.stores().accounts;
        let now = Utc::now();

        let mut candidates = Vec::new();
        match explicit {
            Some(ids) => {
                for id in ids {
                    match accounts.get(*id).await? {
                        Some(account) if account.entity_id == entity.id => candidates.push(account),
                        Some(_) => warn!(account_id = %id, "Account belongs to another entity, skipped"),
                        None => return Err(ProvisioningError::not_found("account", id)),
                    }
                }
            }
            None => {
                for account in accounts.list_by_entity(entity.id).await? {
                    if self.system(account.system_id).await?.supports_password_change {
                        candidates.push(account);
                    }
                }
            }
        }

        candidates.retain(|account| {
            let eligible = !account.frozen && !account.is_protected(now);
            if !eligible {
                debug!(account_id = %account.id, "Account is protected or frozen, skipped");
            }
            eligible
        });
        Ok(candidates)
    }

    async fn change_account(
        &self,
        account: &mut Account,
        entity: &ProvisioningEntity,
        new_password: &GuardedString,
    ) -> ProvisioningResult<AccountOperationResult> {
        let Some((system_mapping, attributes)) = self.service.mapped_attributes(account).await? else {
            return Ok(AccountOperationResult::new(
                account,
                OperationState::NotExecuted,
                NO_PASSWORD_ATTRIBUTE_CODE,
            ));
        };

        let canonical = attributes
            .iter()
            .find(|m| m.password && !m.is_disabled());
        let additional: Vec<&AttributeMapping> = attributes
            .iter()
            .filter(|m| m.send_on_password_change && !m.password && !m.is_disabled())
            .collect();

        let groups: Vec<Vec<&AttributeMapping>> = match canonical {
            None if additional.is_empty() => {
                debug!(account_id = %account.id, "No password attribute mapped");
                return Ok(AccountOperationResult::new(
                    account,
                    OperationState::NotExecuted,
                    NO_PASSWORD_ATTRIBUTE_CODE,
                ));
            }
            _ if self.service.config().send_password_attributes_together => {
                vec![canonical.into_iter().chain(additional).collect()]
            }
            Some(canonical) => {
                let mut groups = vec![vec![canonical]];
                if !additional.is_empty() {
                    groups.push(additional);
                }
                groups
            }
            None => vec![additional],
        };

        let system = self.system(account.system_id).await?;
        let system_entity = self.service.ensure_system_entity(account, &system).await?;

        let mut state = OperationState::Executed;
        for group in groups {
            let mut operation = ProvisioningOperation::new(
                system.id,
                system_entity.id,
                system_entity.uid.clone(),
                OperationType::Update,
                account.entity_type,
            );
            operation.entity_identifier = Some(entity.id);
            self.fill(&mut operation, &group, entity, new_password, &system_mapping)?;

            let done = self.service.queue_and_execute(operation).await?;
            state = merge_states(state, done.state());
        }

        let code = match state {
            OperationState::Executed => ACCOUNT_SUCCESS_CODE,
            OperationState::NotExecuted => NO_PASSWORD_ATTRIBUTE_CODE,
            _ => ACCOUNT_FAILED_CODE,
        };
        Ok(AccountOperationResult::new(account, state, code))
    }

    /// Transform the new password once per attribute and write it into both
    /// objects of the operation.
    fn fill(
        &self,
        operation: &mut ProvisioningOperation,
        group: &[&AttributeMapping],
        entity: &ProvisioningEntity,
        new_password: &GuardedString,
        system_mapping: &SystemMapping,
    ) -> ProvisioningResult<()> {
        let mut account_object = AccountObject::new();
        let mut connector_object =
            ConnectorObject::new(&system_mapping.object_class, Some(operation.system_entity_uid.clone()));

        for mapping in group {
            let value = self.service.contexts().transform(
                mapping,
                entity,
                AttributeValue::Guarded(new_password.clone()),
            )?;
            account_object.insert(AttributeKey::for_mapping(mapping), value.clone());
            connector_object.set(ConnectorAttribute::new(
                mapping.schema_attribute.name.clone(),
                value,
            ));
        }

        operation.account_object = account_object;
        operation.connector_object = connector_object;
        Ok(())
    }

    async fn system(&self, id: SystemId) -> ProvisioningResult<System> {
        let systems = &self.service.stores().systems;
        self.systems
            .get_or_fetch(&id, || systems.get(id))
            .await?
            .ok_or_else(|| ProvisioningError::not_found("system", id))
    }
}

/// Combined state of an account touched by several operations: any failure
/// wins, then not executed, then executed. Operations left queued without a
/// reply count as failures.
fn merge_states(current: OperationState, next: OperationState) -> OperationState {
    fn rank(state: OperationState) -> u8 {
        match state {
            OperationState::Executed => 0,
            OperationState::NotExecuted => 1,
            _ => 2,
        }
    }
    let worst = if rank(next) >= rank(current) { next } else { current };
    match worst {
        OperationState::Executed | OperationState::NotExecuted => worst,
        _ => OperationState::Exception,
    }
}
