//! Wiring of every lifecycle service over one set of stores.

use std::sync::Arc;

use arena_state::fakes::{MemoryEvaluationStore, MemoryPersonaStore, MemoryTestRunStore};
use arena_state::{EvaluationStore, PersonaStore, SurrealArenaStore, TestRunStore};

use crate::abort::AbortController;
use crate::evaluation::EvaluationService;
use crate::notifier::WorkflowNotifier;
use crate::persona::PersonaService;
use crate::promotion::PromotionService;
use crate::reconciliation::ReconciliationService;
use crate::review_gate::ReviewGate;
use crate::state_machine::TestRunStateMachine;
use crate::trigger::RunTrigger;

/// The three stores the services are written against.
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn TestRunStore>,
    pub evaluations: Arc<dyn EvaluationStore>,
    pub personas: Arc<dyn PersonaStore>,
}

impl Stores {
    /// Fresh in-memory fakes.
    pub fn memory() -> Self {
        Self {
            runs: Arc::new(MemoryTestRunStore::new()),
            evaluations: Arc::new(MemoryEvaluationStore::new()),
            personas: Arc::new(MemoryPersonaStore::new()),
        }
    }

    /// One SurrealDB connection serving all three stores.
    pub fn surreal(store: SurrealArenaStore) -> Self {
        let store = Arc::new(store);
        Self {
            runs: store.clone(),
            evaluations: store.clone(),
            personas: store,
        }
    }
}

/// Every lifecycle service, sharing stores and notifier.
pub struct Arena {
    pub stores: Stores,
    pub state_machine: TestRunStateMachine,
    pub aborts: AbortController,
    pub review: ReviewGate,
    pub reconciler: ReconciliationService,
    pub promotion: PromotionService,
    pub evaluations: EvaluationService,
    pub personas: PersonaService,
    pub trigger: RunTrigger,
}

impl Arena {
    pub fn new(stores: Stores, notifier: Arc<dyn WorkflowNotifier>) -> Self {
        Self {
            state_machine: TestRunStateMachine::new(stores.runs.clone()),
            aborts: AbortController::new(stores.runs.clone(), notifier.clone()),
            review: ReviewGate::new(stores.runs.clone(), notifier.clone()),
            reconciler: ReconciliationService::new(
                stores.runs.clone(),
                stores.evaluations.clone(),
            ),
            promotion: PromotionService::new(stores.evaluations.clone()),
            evaluations: EvaluationService::new(
                stores.runs.clone(),
                stores.evaluations.clone(),
                notifier.clone(),
            ),
            personas: PersonaService::new(stores.personas.clone()),
            trigger: RunTrigger::new(stores.runs.clone(), notifier),
            stores,
        }
    }
}
