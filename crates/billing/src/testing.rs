//! In-memory fakes for the billing seams
//!
//! Available to this crate's tests and to downstream crates through the
//! `test-util` feature.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{Notification, Notifier};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeRequest, CheckoutRequest, CheckoutSessionSummary, GatewayAccounts, GatewayLineItem,
    PaymentGateway, PaymentIntentSummary,
};
use crate::lifecycle::WorkLifecycle;
use crate::meeting::MeetingProvider;
use crate::processor::PaymentProcessor;
use crate::store::WorkStore;
use crate::work::{Category, ClassSession, UserContact, Work, WorkStatus};

/// Work store backed by a map, with the same version check as Postgres
#[derive(Default)]
pub struct MemoryWorkStore {
    works: Mutex<HashMap<Uuid, Work>>,
    users: Mutex<HashMap<Uuid, UserContact>>,
    sessions: Mutex<HashMap<String, ClassSession>>,
    saves: AtomicU64,
    scheduled_failure: Mutex<Option<(u64, BillingError)>>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: UserContact) {
        self.users.lock().unwrap().insert(user.id, user);
    }

    /// Register a user with a generated id and return it
    pub fn add_test_user(&self, email: &str) -> UserContact {
        let user = UserContact {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: email.split('@').next().unwrap_or(email).to_string(),
        };
        self.add_user(user.clone());
        user
    }

    pub fn put_work(&self, work: Work) {
        self.works.lock().unwrap().insert(work.id, work);
    }

    pub fn set_class_session(&self, session: ClassSession) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.service.clone(), session);
    }

    /// Current stored copy of a work
    pub fn work(&self, work_id: Uuid) -> Option<Work> {
        self.works.lock().unwrap().get(&work_id).cloned()
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    /// Let `successes` more saves through, then fail the next one with `error`
    pub fn fail_save_after(&self, successes: u64, error: BillingError) {
        let at = self.save_count() + successes;
        *self.scheduled_failure.lock().unwrap() = Some((at, error));
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn get_work(&self, work_id: Uuid) -> BillingResult<Work> {
        self.work(work_id)
            .ok_or_else(|| BillingError::NotFound(format!("Work {} not found", work_id)))
    }

    async fn insert_work(&self, work: &Work) -> BillingResult<()> {
        self.put_work(work.clone());
        Ok(())
    }

    async fn save_work(&self, work: &Work) -> BillingResult<Work> {
        {
            let mut scheduled = self.scheduled_failure.lock().unwrap();
            if scheduled.as_ref().is_some_and(|(at, _)| *at == self.save_count()) {
                if let Some((_, error)) = scheduled.take() {
                    return Err(error);
                }
            }
        }

        let mut works = self.works.lock().unwrap();
        let stored = works
            .get(&work.id)
            .ok_or_else(|| BillingError::NotFound(format!("Work {} not found", work.id)))?;

        if stored.version != work.version {
            return Err(BillingError::ConcurrentModification);
        }

        let mut saved = work.clone();
        saved.version += 1;
        works.insert(saved.id, saved.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(saved)
    }

    async fn find_due_subscriptions(&self, now: OffsetDateTime) -> BillingResult<Vec<Work>> {
        let mut due: Vec<Work> = self
            .works
            .lock()
            .unwrap()
            .values()
            .filter(|w| w.status == WorkStatus::Subscribed)
            .filter(|w| w.next_payment_due().map(|d| d <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|w| w.next_payment_due());
        Ok(due)
    }

    async fn list_works(&self) -> BillingResult<Vec<Work>> {
        Ok(self.works.lock().unwrap().values().cloned().collect())
    }

    async fn get_user(&self, user_id: Uuid) -> BillingResult<UserContact> {
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("User {} not found", user_id)))
    }

    async fn open_class_session(&self, service: &str) -> BillingResult<Option<ClassSession>> {
        Ok(self.sessions.lock().unwrap().get(service).cloned())
    }
}

#[derive(Default)]
struct GatewayState {
    customers: HashMap<String, String>,
    sessions: HashMap<String, CheckoutSessionSummary>,
    intents: HashMap<String, (String, PaymentIntentSummary)>,
    checkouts: Vec<CheckoutRequest>,
    charges: Vec<ChargeRequest>,
    attached: Vec<(String, String)>,
    detached: Vec<String>,
    failing_methods: HashSet<String>,
    declined_methods: HashSet<String>,
}

/// Gateway double: customers, sessions and intents live in memory.
///
/// Checkout sessions start unpaid; flip them with [`FakeGateway::set_session_paid`].
/// Charges succeed unless the payment method was registered with
/// [`FakeGateway::fail_charges_for`] (call error) or
/// [`FakeGateway::decline_charges_for`] (intent not succeeded).
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    counter: AtomicU64,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn fail_charges_for(&self, payment_method_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_methods
            .insert(payment_method_id.to_string());
    }

    pub fn decline_charges_for(&self, payment_method_id: &str) {
        self.state
            .lock()
            .unwrap()
            .declined_methods
            .insert(payment_method_id.to_string());
    }

    pub fn set_session_paid(&self, session_id: &str, paid: bool) {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| CheckoutSessionSummary {
                id: session_id.to_string(),
                url: None,
                paid,
                amount_total: None,
                payment_intent_id: None,
                payment_method_id: None,
            });
        session.paid = paid;
    }

    /// Mark a session paid with the card the customer entered
    pub fn complete_session(&self, session_id: &str, payment_method_id: &str) {
        self.set_session_paid(session_id, true);
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.payment_method_id = Some(payment_method_id.to_string());
            session.payment_intent_id = Some(format!("pi_for_{}", session_id));
        }
    }

    pub fn customer_count(&self) -> usize {
        self.state.lock().unwrap().customers.len()
    }

    pub fn checkouts(&self) -> Vec<CheckoutRequest> {
        self.state.lock().unwrap().checkouts.clone()
    }

    pub fn last_checkout(&self) -> Option<CheckoutRequest> {
        self.state.lock().unwrap().checkouts.last().cloned()
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.state.lock().unwrap().charges.clone()
    }

    /// (customer, payment method) pairs attached so far
    pub fn attached(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().attached.clone()
    }

    pub fn detached(&self) -> Vec<String> {
        self.state.lock().unwrap().detached.clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn find_customer_by_email(&self, email: &str) -> BillingResult<Option<String>> {
        Ok(self.state.lock().unwrap().customers.get(email).cloned())
    }

    async fn create_customer(&self, email: &str, _name: &str) -> BillingResult<String> {
        let id = self.next_id("cus");
        self.state
            .lock()
            .unwrap()
            .customers
            .insert(email.to_string(), id.clone());
        Ok(id)
    }

    async fn attach_payment_method(
        &self,
        customer_id: &str,
        payment_method_id: &str,
    ) -> BillingResult<()> {
        self.state
            .lock()
            .unwrap()
            .attached
            .push((customer_id.to_string(), payment_method_id.to_string()));
        Ok(())
    }

    async fn detach_payment_method(&self, payment_method_id: &str) -> BillingResult<()> {
        self.state
            .lock()
            .unwrap()
            .detached
            .push(payment_method_id.to_string());
        Ok(())
    }

    async fn payment_method_last4(
        &self,
        _payment_method_id: &str,
    ) -> BillingResult<Option<String>> {
        Ok(Some("4242".to_string()))
    }

    async fn create_checkout_session(
        &self,
        request: CheckoutRequest,
    ) -> BillingResult<CheckoutSessionSummary> {
        let id = self.next_id("cs");
        let session = CheckoutSessionSummary {
            id: id.clone(),
            url: Some(format!("https://checkout.test/{}", id)),
            paid: false,
            amount_total: Some(request.amount_minor),
            payment_intent_id: None,
            payment_method_id: None,
        };

        let mut state = self.state.lock().unwrap();
        state.sessions.insert(id, session.clone());
        state.checkouts.push(request);
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
    ) -> BillingResult<CheckoutSessionSummary> {
        self.state
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| BillingError::PaymentFailed(format!("No such checkout session: {}", session_id)))
    }

    async fn checkout_line_items(&self, session_id: &str) -> BillingResult<Vec<GatewayLineItem>> {
        let state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| BillingError::PaymentFailed(format!("No such checkout session: {}", session_id)))?;

        Ok(vec![GatewayLineItem {
            description: "Checkout".to_string(),
            amount_total: session.amount_total.unwrap_or_default(),
            quantity: Some(1),
        }])
    }

    async fn create_payment_intent(
        &self,
        request: ChargeRequest,
    ) -> BillingResult<PaymentIntentSummary> {
        let id = self.next_id("pi");
        let mut state = self.state.lock().unwrap();

        if state.failing_methods.contains(&request.payment_method_id) {
            return Err(BillingError::PaymentFailed("card_declined".to_string()));
        }

        let succeeded = !state.declined_methods.contains(&request.payment_method_id);
        let intent = PaymentIntentSummary {
            id: id.clone(),
            amount: request.amount_minor,
            currency: request.currency.clone(),
            status: if succeeded { "succeeded" } else { "requires_payment_method" }.to_string(),
            succeeded,
            payment_method_id: Some(request.payment_method_id.clone()),
            description: Some(request.description.clone()),
            created: OffsetDateTime::now_utc().unix_timestamp(),
        };

        state
            .intents
            .insert(id, (request.customer_id.clone(), intent.clone()));
        state.charges.push(request);
        Ok(intent)
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentSummary> {
        self.state
            .lock()
            .unwrap()
            .intents
            .get(payment_intent_id)
            .map(|(_, intent)| intent.clone())
            .ok_or_else(|| BillingError::PaymentFailed(format!("No such payment intent: {}", payment_intent_id)))
    }

    async fn list_payment_intents(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<PaymentIntentSummary>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .intents
            .values()
            .filter(|(customer, _)| customer == customer_id)
            .map(|(_, intent)| intent.clone())
            .collect())
    }
}

/// Notifier that keeps everything it was asked to send
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.kind() == kind)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: Notification) {
        self.sent.lock().unwrap().push(notification);
    }
}

/// Meeting provider that records cancellations and can be told to fail
#[derive(Default)]
pub struct FakeMeetings {
    cancelled: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl FakeMeetings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let meetings = Self::default();
        *meetings.fail.lock().unwrap() = true;
        meetings
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl MeetingProvider for FakeMeetings {
    async fn cancel_meeting(&self, meeting_id: &str) -> BillingResult<()> {
        if *self.fail.lock().unwrap() {
            return Err(BillingError::Config("meeting service unavailable".to_string()));
        }
        self.cancelled.lock().unwrap().push(meeting_id.to_string());
        Ok(())
    }
}

/// Lifecycle wired to in-memory fakes, with one registered customer
pub struct TestHarness {
    pub store: Arc<MemoryWorkStore>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub meetings: Arc<FakeMeetings>,
    pub processor: Arc<PaymentProcessor>,
    pub lifecycle: Arc<WorkLifecycle>,
    pub user: UserContact,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_meetings(FakeMeetings::new())
    }

    pub fn with_meetings(meetings: FakeMeetings) -> Self {
        let store = Arc::new(MemoryWorkStore::new());
        let gateway = Arc::new(FakeGateway::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let meetings = Arc::new(meetings);
        let processor = Arc::new(PaymentProcessor::new(
            GatewayAccounts::shared(gateway.clone()),
            "https://app.test",
            "usd",
        ));
        let lifecycle = Arc::new(WorkLifecycle::new(
            store.clone(),
            processor.clone(),
            notifier.clone(),
            meetings.clone(),
        ));
        let user = store.add_test_user("ada@example.com");

        Self {
            store,
            gateway,
            notifier,
            meetings,
            processor,
            lifecycle,
            user,
        }
    }

    /// A fresh, unsaved work owned by the harness user
    pub fn new_work(&self, category: Category, status: WorkStatus) -> Work {
        Work::new(self.user.id, category, "web-development", status)
    }

    /// Full service sharing this harness's store, gateway and notifier
    pub fn service(&self) -> crate::BillingService {
        let mut secrets = HashMap::new();
        for category in Category::ALL {
            secrets.insert(category, format!("whsec_{}", category));
        }
        crate::BillingService::assemble(
            self.store.clone(),
            self.processor.clone(),
            self.notifier.clone(),
            self.meetings.clone(),
            secrets,
        )
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
