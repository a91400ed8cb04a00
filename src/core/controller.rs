use crate::core::decoder::StreamDecoder;
use crate::core::history::HistoryCache;
use crate::domain::model::{
    AnalysisPayload, BirthForm, HistoryEntry, LocationCodes, DATE_FORMAT, LUNAR_YEAR_SPAN,
    TIME_FORMAT,
};
use crate::domain::ports::{AnalysisTransport, KeyValueStore};
use crate::domain::region::RegionCascade;
use crate::utils::error::{LingxunError, MissingField, Result};
use crate::utils::validation::in_range;
use chrono::{Datelike, Local, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatus {
    #[default]
    Idle,
    Validating,
    Sending,
    Streaming,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// 目前唯一可見的請求狀態。新的提交會以新的 `session_id` 取代它。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: u64,
    pub status: RequestStatus,
    pub result_text: String,
    pub error_message: Option<String>,
    pub loading: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Completed(String),
    /// 串流期間有更新的提交，這次的輸出已被丟棄
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    pub payload: AnalysisPayload,
    pub location: LocationCodes,
}

/// 驗證表單並組出 payload，只會帶入目前曆法模式的欄位
pub fn build_request(form: &BirthForm, region: &RegionCascade) -> Result<PreparedRequest> {
    let missing = |field| LingxunError::ValidationError { field };

    let gender = form.gender.ok_or_else(|| missing(MissingField::Gender))?;

    let (Some(province), Some(city), Some(area)) =
        (region.province(), region.city(), region.area())
    else {
        return Err(missing(MissingField::Location));
    };
    let birth_location = region
        .location_label()
        .ok_or_else(|| missing(MissingField::Location))?;

    let time = form
        .time
        .ok_or_else(|| missing(MissingField::Time))?
        .format(TIME_FORMAT)
        .to_string();

    let (year, month, day, birth_time) = if form.is_lunar() {
        let this_year = Local::now().year();
        let year = in_range(form.lunar.year, this_year - LUNAR_YEAR_SPAN + 1, this_year)
            .ok_or_else(|| missing(MissingField::Date))?;
        let month = in_range(form.lunar.month, 1, 12).ok_or_else(|| missing(MissingField::Date))?;
        let day = in_range(form.lunar.day, 1, 30).ok_or_else(|| missing(MissingField::Date))?;
        (Some(year), Some(month), Some(day), time)
    } else {
        let date = form.solar_date.ok_or_else(|| missing(MissingField::Date))?;
        (None, None, None, format!("{} {}", date.format(DATE_FORMAT), time))
    };

    Ok(PreparedRequest {
        payload: AnalysisPayload {
            name: form.display_name().to_string(),
            gender,
            birth_location,
            is_lunar: form.is_lunar(),
            year,
            month,
            day,
            birth_time,
        },
        location: LocationCodes {
            province: province.to_string(),
            city: city.to_string(),
            area: area.to_string(),
        },
    })
}

/// 分析請求的狀態機:
/// `Idle → Validating → Sending → Streaming → Completed`，三個中間狀態都可能轉為 `Failed`。
///
/// 所有狀態更新都透過 watch channel 發佈，發佈前比對 `session_id`，
/// 被取代的 session 的輸出一律丟棄。
pub struct AnalysisController<T: AnalysisTransport, S: KeyValueStore> {
    transport: T,
    history: Mutex<HistoryCache<S>>,
    state: watch::Sender<SessionSnapshot>,
    next_session: AtomicU64,
}

impl<T: AnalysisTransport, S: KeyValueStore> AnalysisController<T, S> {
    pub fn new(transport: T, history: HistoryCache<S>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            transport,
            history: Mutex::new(history),
            state,
            next_session: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().await.entries().to_vec()
    }

    pub async fn history_entry(&self, index: usize) -> Option<HistoryEntry> {
        self.history.lock().await.get(index).cloned()
    }

    /// 捨棄目前的 session 並回到 Idle (例如畫面關閉時)
    pub fn reset(&self) {
        let id = self.begin_session();
        self.state.send_replace(SessionSnapshot {
            session_id: id,
            ..Default::default()
        });
    }

    pub async fn submit(&self, form: &BirthForm, region: &RegionCascade) -> Result<SubmitOutcome> {
        let id = self.begin_session();
        self.state.send_replace(SessionSnapshot {
            session_id: id,
            status: RequestStatus::Validating,
            ..Default::default()
        });

        let span = tracing::info_span!("analysis", session = id);
        self.run_session(id, form, region).instrument(span).await
    }

    fn begin_session(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn run_session(
        &self,
        id: u64,
        form: &BirthForm,
        region: &RegionCascade,
    ) -> Result<SubmitOutcome> {
        let request = match build_request(form, region) {
            Ok(request) => request,
            Err(e) => return self.fail(id, e),
        };

        self.publish(id, |s| {
            s.status = RequestStatus::Sending;
            s.loading = true;
        });
        tracing::info!(
            "Requesting analysis for {} ({})",
            request.payload.name,
            request.payload.birth_location
        );

        let mut stream = match self.transport.open(&request.payload).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(id, e),
        };

        if !self.publish(id, |s| s.status = RequestStatus::Streaming) {
            tracing::debug!("Session superseded before the stream opened");
            return Ok(SubmitOutcome::Superseded);
        }

        // 串流一開啟就先記錄，即使之後中斷也保留這筆歷史
        self.record_history(&request).await;

        let mut decoder = StreamDecoder::new();
        let mut chunks = 0usize;
        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return self.fail(id, e),
            };
            chunks += 1;

            let mut text = String::new();
            let decoded = decoder.decode(&chunk, &mut text);
            if !self.append(id, &text) {
                tracing::debug!("Discarding chunk {} of superseded session", chunks);
                return Ok(SubmitOutcome::Superseded);
            }
            if let Err(e) = decoded {
                return self.fail(id, e);
            }
        }

        let tail = match decoder.finalize() {
            Ok(tail) => tail,
            Err(e) => return self.fail(id, e),
        };

        let mut result = None;
        let current = self.publish(id, |s| {
            s.result_text.push_str(&tail);
            s.status = RequestStatus::Completed;
            s.loading = false;
            result = Some(s.result_text.clone());
        });

        match result {
            Some(text) if current => {
                tracing::info!(
                    "Analysis completed ({} chunks, {} chars)",
                    chunks,
                    text.chars().count()
                );
                Ok(SubmitOutcome::Completed(text))
            }
            _ => Ok(SubmitOutcome::Superseded),
        }
    }

    fn is_current(&self, id: u64) -> bool {
        self.state.borrow().session_id == id
    }

    /// 只在 `id` 仍是目前 session 時套用更新並通知訂閱者
    fn publish(&self, id: u64, update: impl FnOnce(&mut SessionSnapshot)) -> bool {
        self.state.send_if_modified(|current| {
            if current.session_id != id {
                return false;
            }
            update(current);
            true
        })
    }

    /// 第一次有實際文字輸出時關閉 loading，只會發生一次
    fn append(&self, id: u64, text: &str) -> bool {
        if text.is_empty() {
            return self.is_current(id);
        }
        self.publish(id, |s| {
            s.result_text.push_str(text);
            s.loading = false;
        })
    }

    fn fail(&self, id: u64, err: LingxunError) -> Result<SubmitOutcome> {
        let message = err.to_string();
        let current = self.publish(id, |s| {
            s.status = RequestStatus::Failed;
            s.error_message = Some(message);
            s.loading = false;
        });

        if !current {
            tracing::debug!("Dropping error from superseded session: {}", err);
            return Ok(SubmitOutcome::Superseded);
        }
        tracing::warn!("Analysis failed ({:?}): {}", err.category(), err);
        Err(err)
    }

    async fn record_history(&self, request: &PreparedRequest) {
        let entry = HistoryEntry::from_payload(&request.payload, &request.location, Utc::now());
        let mut history = self.history.lock().await;
        if let Err(e) = history.record(entry).await {
            tracing::warn!("Could not save history: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::store::MemoryStore;
    use crate::domain::model::{CalendarMode, Gender, LunarDate, PLACEHOLDER_NAME};
    use crate::domain::ports::ChunkStream;
    use crate::domain::region::RegionTable;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveTime};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    enum ChunkSource {
        Script(VecDeque<Result<Vec<u8>>>),
        Channel(mpsc::UnboundedReceiver<Result<Vec<u8>>>),
    }

    /// 每次讀 chunk 前記下當下發佈的狀態，用來檢查上一塊處理後的結果
    struct ScriptedStream {
        source: ChunkSource,
        observer: Option<watch::Receiver<SessionSnapshot>>,
        seen: Arc<std::sync::Mutex<Vec<SessionSnapshot>>>,
    }

    #[async_trait]
    impl ChunkStream for ScriptedStream {
        async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
            if let Some(observer) = &self.observer {
                let snapshot = observer.borrow().clone();
                self.seen.lock().unwrap().push(snapshot);
            }
            let next = match &mut self.source {
                ChunkSource::Script(chunks) => chunks.pop_front(),
                ChunkSource::Channel(rx) => rx.recv().await,
            };
            next.transpose()
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        responses: std::sync::Mutex<VecDeque<Result<ChunkSource>>>,
        observer: std::sync::Mutex<Option<watch::Receiver<SessionSnapshot>>>,
        seen: Arc<std::sync::Mutex<Vec<SessionSnapshot>>>,
        opened: AtomicUsize,
    }

    impl ScriptedTransport {
        fn push_script(&self, chunks: Vec<Result<Vec<u8>>>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(ChunkSource::Script(chunks.into())));
        }

        fn push_channel(&self, rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>) {
            self.responses
                .lock()
                .unwrap()
                .push_back(Ok(ChunkSource::Channel(rx)));
        }

        fn push_error(&self, err: LingxunError) {
            self.responses.lock().unwrap().push_back(Err(err));
        }

        fn observe(&self, rx: watch::Receiver<SessionSnapshot>) {
            *self.observer.lock().unwrap() = Some(rx);
        }

        fn seen(&self) -> Vec<SessionSnapshot> {
            self.seen.lock().unwrap().clone()
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisTransport for ScriptedTransport {
        async fn open(&self, _payload: &AnalysisPayload) -> Result<Box<dyn ChunkStream>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let response = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted response left");
            let source = response?;
            Ok(Box::new(ScriptedStream {
                source,
                observer: self.observer.lock().unwrap().clone(),
                seen: self.seen.clone(),
            }))
        }
    }

    fn region() -> RegionCascade {
        let mut region = RegionCascade::new(Arc::new(RegionTable::bundled().unwrap()));
        region.restore("44", Some("4401"), Some("440106"));
        region
    }

    fn solar_form(name: &str) -> BirthForm {
        BirthForm {
            name: name.to_string(),
            gender: Some(Gender::Male),
            calendar: CalendarMode::Solar,
            solar_date: NaiveDate::from_ymd_opt(1990, 5, 1),
            lunar: LunarDate::default(),
            time: NaiveTime::from_hms_opt(12, 0, 0),
        }
    }

    async fn build_controller(
        transport: ScriptedTransport,
    ) -> (AnalysisController<ScriptedTransport, MemoryStore>, MemoryStore) {
        let store = MemoryStore::new();
        let history = HistoryCache::load(store.clone()).await;
        let controller = AnalysisController::new(transport, history);
        controller.transport().observe(controller.subscribe());
        (controller, store)
    }

    fn bytes(s: &str) -> Result<Vec<u8>> {
        Ok(s.as_bytes().to_vec())
    }

    #[test]
    fn test_build_solar_payload_uses_placeholder_name() {
        let request = build_request(&solar_form("   "), &region()).unwrap();
        assert_eq!(request.payload.name, PLACEHOLDER_NAME);
        assert_eq!(request.payload.birth_location, "广东省/广州市/天河区");
        assert_eq!(request.payload.birth_time, "1990-05-01 12:00:00");
        assert!(!request.payload.is_lunar);
        assert_eq!(request.payload.year, None);
        assert_eq!(request.location.area, "440106");
    }

    #[test]
    fn test_build_lunar_payload_ignores_solar_date() {
        let mut form = solar_form("李四");
        form.set_calendar(CalendarMode::Lunar);
        form.lunar = LunarDate {
            year: Some(1988),
            month: Some(8),
            day: Some(15),
        };
        let request = build_request(&form, &region()).unwrap();
        assert!(request.payload.is_lunar);
        assert_eq!(request.payload.birth_time, "12:00:00");
        assert_eq!(
            (request.payload.year, request.payload.month, request.payload.day),
            (Some(1988), Some(8), Some(15))
        );

        form.set_calendar(CalendarMode::Solar);
        let request = build_request(&form, &region()).unwrap();
        assert_eq!(request.payload.birth_time, "1990-05-01 12:00:00");
    }

    #[test]
    fn test_build_request_reports_missing_category() {
        let field_of = |form: &BirthForm, region: &RegionCascade| match build_request(form, region) {
            Err(LingxunError::ValidationError { field }) => field,
            other => panic!("expected validation error, got {:?}", other),
        };

        let mut form = solar_form("a");
        form.gender = None;
        assert_eq!(field_of(&form, &region()), MissingField::Gender);

        let mut partial = region();
        partial.select_city("4403");
        assert_eq!(field_of(&solar_form("a"), &partial), MissingField::Location);

        let mut form = solar_form("a");
        form.time = None;
        assert_eq!(field_of(&form, &region()), MissingField::Time);

        let mut form = solar_form("a");
        form.solar_date = None;
        assert_eq!(field_of(&form, &region()), MissingField::Date);

        let mut form = solar_form("a");
        form.set_calendar(CalendarMode::Lunar);
        form.lunar = LunarDate {
            year: Some(1988),
            month: Some(13),
            day: Some(1),
        };
        assert_eq!(field_of(&form, &region()), MissingField::Date);

        for year in [0, -5, Local::now().year() - LUNAR_YEAR_SPAN, Local::now().year() + 1] {
            form.lunar = LunarDate {
                year: Some(year),
                month: Some(8),
                day: Some(15),
            };
            assert_eq!(field_of(&form, &region()), MissingField::Date, "year {}", year);
        }
    }

    #[tokio::test]
    async fn test_missing_gender_fails_without_network_call() {
        let (controller, _) = build_controller(ScriptedTransport::default()).await;
        let mut form = solar_form("a");
        form.gender = None;

        let err = controller.submit(&form, &region()).await.unwrap_err();
        assert!(matches!(err, LingxunError::ValidationError { field: MissingField::Gender }));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert!(snapshot.error_message.unwrap().contains("gender"));
        assert!(!snapshot.loading);
        assert_eq!(controller.transport().opened(), 0);
        assert!(controller.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_split_character_clears_loading_on_first_output() {
        let transport = ScriptedTransport::default();
        let spring = "春".as_bytes();
        transport.push_script(vec![
            Ok(spring[..1].to_vec()),
            Ok(spring[1..].to_vec()),
            bytes("天"),
        ]);
        let (controller, _) = build_controller(transport).await;

        let outcome = controller.submit(&solar_form("a"), &region()).await.unwrap();
        assert_eq!(outcome, SubmitOutcome::Completed("春天".to_string()));

        // seen[i] 是處理完第 i 塊後的狀態 (seen[0] 為串流剛開啟時)
        let seen = controller.transport().seen();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].loading && seen[0].result_text.is_empty());
        assert!(seen[1].loading && seen[1].result_text.is_empty());
        assert!(!seen[2].loading);
        assert_eq!(seen[2].result_text, "春");
        assert_eq!(seen[3].result_text, "春天");
        assert!(seen.iter().all(|s| !s.result_text.contains('\u{FFFD}')));
        assert!(seen.iter().all(|s| s.status == RequestStatus::Streaming));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert_eq!(snapshot.result_text, "春天");
    }

    #[tokio::test]
    async fn test_interrupted_stream_keeps_history_and_partial_text() {
        let transport = ScriptedTransport::default();
        transport.push_script(vec![
            bytes("部分"),
            Err(LingxunError::StreamError {
                message: "connection reset".to_string(),
            }),
        ]);
        let (controller, store) = build_controller(transport).await;

        let err = controller.submit(&solar_form("王五"), &region()).await.unwrap_err();
        assert!(matches!(err, LingxunError::StreamError { .. }));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(snapshot.result_text, "部分");
        assert!(!snapshot.loading);

        let history = controller.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].name, "王五");
        assert_eq!(history[0].city_code.as_deref(), Some("4401"));
        assert!(store.load("baziHistory").await.unwrap().unwrap().contains("王五"));
    }

    #[tokio::test]
    async fn test_http_error_records_no_history() {
        let transport = ScriptedTransport::default();
        transport.push_error(LingxunError::HttpError {
            status: 500,
            message: "rate limited".to_string(),
        });
        let (controller, _) = build_controller(transport).await;

        assert!(controller.submit(&solar_form("a"), &region()).await.is_err());
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(snapshot.error_message.as_deref(), Some("rate limited"));
        assert!(controller.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_dangling_bytes_at_end_fail_the_session() {
        let transport = ScriptedTransport::default();
        transport.push_script(vec![Ok(vec![b'o', b'k', 0xe6, 0x98])]);
        let (controller, _) = build_controller(transport).await;

        let err = controller.submit(&solar_form("a"), &region()).await.unwrap_err();
        assert!(matches!(err, LingxunError::DecodeError { .. }));
        assert_eq!(controller.snapshot().result_text, "ok");
        assert_eq!(controller.history().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_bytes_keep_text_before_them() {
        let transport = ScriptedTransport::default();
        transport.push_script(vec![Ok(vec![b'o', b'k', 0xff, b'!'])]);
        let (controller, _) = build_controller(transport).await;

        let err = controller.submit(&solar_form("a"), &region()).await.unwrap_err();
        assert!(matches!(err, LingxunError::DecodeError { .. }));

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Failed);
        assert_eq!(snapshot.result_text, "ok");
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn test_new_submission_supersedes_streaming_one() {
        let transport = ScriptedTransport::default();
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        transport.push_channel(rx_a);
        transport.push_channel(rx_b);
        let (controller, _) = build_controller(transport).await;
        let controller = Arc::new(controller);
        let mut updates = controller.subscribe();

        let task_a = tokio::spawn({
            let controller = controller.clone();
            async move { controller.submit(&solar_form("甲"), &region()).await }
        });
        tx_a.send(bytes("A1")).unwrap();
        updates
            .wait_for(|s| s.session_id == 1 && s.result_text == "A1")
            .await
            .unwrap();

        let task_b = tokio::spawn({
            let controller = controller.clone();
            async move { controller.submit(&solar_form("乙"), &region()).await }
        });
        updates
            .wait_for(|s| s.session_id == 2 && s.status == RequestStatus::Streaming)
            .await
            .unwrap();

        tx_a.send(bytes("A2")).unwrap();
        drop(tx_a);
        assert_eq!(task_a.await.unwrap().unwrap(), SubmitOutcome::Superseded);
        assert_eq!(controller.snapshot().result_text, "");

        tx_b.send(bytes("B1")).unwrap();
        drop(tx_b);
        assert_eq!(
            task_b.await.unwrap().unwrap(),
            SubmitOutcome::Completed("B1".to_string())
        );

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.session_id, 2);
        assert_eq!(snapshot.status, RequestStatus::Completed);
        assert_eq!(snapshot.result_text, "B1");

        let names: Vec<String> = controller.history().await.into_iter().map(|h| h.name).collect();
        assert_eq!(names, vec!["乙".to_string(), "甲".to_string()]);
    }

    #[tokio::test]
    async fn test_reset_discards_running_session() {
        let transport = ScriptedTransport::default();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.push_channel(rx);
        let (controller, _) = build_controller(transport).await;
        let controller = Arc::new(controller);
        let mut updates = controller.subscribe();

        let task = tokio::spawn({
            let controller = controller.clone();
            async move { controller.submit(&solar_form("a"), &region()).await }
        });
        updates
            .wait_for(|s| s.status == RequestStatus::Streaming)
            .await
            .unwrap();

        controller.reset();
        tx.send(bytes("late")).unwrap();
        drop(tx);

        assert_eq!(task.await.unwrap().unwrap(), SubmitOutcome::Superseded);
        let snapshot = controller.snapshot();
        assert_eq!(snapshot.status, RequestStatus::Idle);
        assert!(snapshot.result_text.is_empty());
    }
}
