//! Signing callback handed to the channel session.
//!
//! Every transaction the channel wants co-signed passes through
//! [SigningInterceptor] first. A contract deployment is only signed once its
//! bytecode checks out; a contract call made by anyone else is flagged so the
//! coordinator reacts to it when the resulting state change arrives.

use commonware_cryptography::ed25519::Signature;
use futures::{future::BoxFuture, FutureExt};
use rochambeau_client::{BytecodeVerifier, Sign, SignError};
use rochambeau_types::{ContractBinding, Keypair, SignRequest, Update};
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("interceptor lock poisoned; recovering");
            poisoned.into_inner()
        }
    }
}

/// Two-phase hand-off of opponent actions: marked when co-signed, consumed
/// when the state change for that channel round is delivered.
#[derive(Debug, Default)]
pub struct BotAction {
    pending: Mutex<BTreeSet<u64>>,
}

impl BotAction {
    pub fn mark(&self, round: u64) {
        if !lock(&self.pending).insert(round) {
            warn!(round, "bot action marked twice before it was handled");
        }
    }

    /// Take the mark for `round`. Returns false if there was none.
    pub fn consume(&self, round: u64) -> bool {
        lock(&self.pending).remove(&round)
    }

    pub fn is_pending(&self, round: u64) -> bool {
        lock(&self.pending).contains(&round)
    }

    pub fn clear(&self) {
        lock(&self.pending).clear();
    }
}

pub struct SigningInterceptor {
    keypair: Keypair,
    verifier: Arc<dyn BytecodeVerifier>,
    verify_timeout: Duration,
    contract: Mutex<Option<ContractBinding>>,
    bot_action: BotAction,
}

impl SigningInterceptor {
    pub fn new(
        keypair: Keypair,
        verifier: Arc<dyn BytecodeVerifier>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            keypair,
            verifier,
            verify_timeout,
            contract: Mutex::new(None),
            bot_action: BotAction::default(),
        }
    }

    /// Restore the binding of a contract verified in an earlier session.
    pub fn with_contract(self, binding: ContractBinding) -> Self {
        *lock(&self.contract) = Some(binding);
        self
    }

    /// The verified game contract, once its deployment has been co-signed.
    pub fn contract(&self) -> Option<ContractBinding> {
        lock(&self.contract).clone()
    }

    pub fn bot_action(&self) -> &BotAction {
        &self.bot_action
    }

    /// Forget the contract and any pending marks before a new channel opens.
    pub fn reset(&self) {
        *lock(&self.contract) = None;
        self.bot_action.clear();
    }

    async fn verify(&self, code: &[u8]) -> Result<(), SignError> {
        match timeout(self.verify_timeout, self.verifier.verify(code)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(SignError::BytecodeMismatch),
            Ok(Err(err)) => Err(SignError::Verification(err.to_string())),
            Err(_) => Err(SignError::Verification("verification timed out".to_string())),
        }
    }

    async fn inspect(&self, request: &SignRequest) -> Result<(), SignError> {
        for update in &request.tx.updates {
            match update {
                Update::NewContract { owner, code, .. } => {
                    if let Err(err) = self.verify(code).await {
                        warn!(round = request.tx.round, %owner, %err, "refusing contract deployment");
                        return Err(err);
                    }
                    let binding = ContractBinding::new(owner.clone(), request.tx.round);
                    info!(address = %binding.address, round = request.tx.round, "contract verified");
                    *lock(&self.contract) = Some(binding);
                }
                Update::CallContract { caller, .. } if caller != self.keypair.address() => {
                    debug!(round = request.tx.round, %caller, "opponent call");
                    self.bot_action.mark(request.tx.round);
                }
                Update::CallContract { .. } => {}
            }
        }
        Ok(())
    }
}

impl Sign for SigningInterceptor {
    fn sign<'a>(
        &'a self,
        request: &'a SignRequest,
    ) -> BoxFuture<'a, Result<Signature, SignError>> {
        async move {
            self.inspect(request).await?;
            Ok(self.keypair.sign(&request.payload()))
        }
        .boxed()
    }
}
