use uuid::Uuid;

/// Lifecycle of one batch item. Transitions are driven by the batch runner
/// and its per-task closure, never by UI code directly:
/// `pending -> processing -> {done|error}`, `error -> processing` on retry.
/// `done` only re-enters `processing` through an explicit regenerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Analyzing,
    Processing,
    Done,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// One independently processable unit of a multi-item operation.
#[derive(Debug, Clone)]
pub struct BatchTask {
    pub id: String,
    pub image: String,
    pub selected: bool,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl BatchTask {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image: image.into(),
            selected: true,
            status: TaskStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// A task joins the next run only while selected and not already finished
    /// or in flight, so re-running a batch retries what is left or failed.
    pub fn eligible(&self) -> bool {
        self.selected && matches!(self.status, TaskStatus::Pending | TaskStatus::Error)
    }

    pub fn mark_processing(&mut self) {
        self.status = TaskStatus::Processing;
        self.error = None;
    }

    pub fn mark_done(&mut self, result: impl Into<String>) {
        self.status = TaskStatus::Done;
        self.result = Some(result.into());
        self.error = None;
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.status = TaskStatus::Error;
        self.error = Some(message.into());
    }

    /// Explicit regenerate: the only path that takes a finished task back
    /// into the queue.
    pub fn reset_for_regenerate(&mut self) {
        self.status = TaskStatus::Pending;
        self.result = None;
        self.error = None;
    }
}

/// Aggregate over one run's snapshot of eligible tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
}

impl BatchProgress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
        }
    }

    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        ((self.completed as f64 / self.total as f64) * 100.0).round() as u32
    }
}

/// Indices of the tasks a run would pick up, in queue order.
pub fn eligible_indices(tasks: &[BatchTask]) -> Vec<usize> {
    tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.eligible())
        .map(|(idx, _)| idx)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_with(status: TaskStatus, selected: bool) -> BatchTask {
        let mut task = BatchTask::new("data:image/png;base64,AAAA");
        task.status = status;
        task.selected = selected;
        task
    }

    #[test]
    fn new_tasks_are_selected_and_pending() {
        let task = BatchTask::new("data:image/png;base64,AAAA");
        assert!(task.selected);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.eligible());
    }

    #[test]
    fn eligibility_covers_pending_and_error_only() {
        assert!(task_with(TaskStatus::Pending, true).eligible());
        assert!(task_with(TaskStatus::Error, true).eligible());
        assert!(!task_with(TaskStatus::Done, true).eligible());
        assert!(!task_with(TaskStatus::Processing, true).eligible());
        assert!(!task_with(TaskStatus::Analyzing, true).eligible());
    }

    #[test]
    fn deselected_tasks_are_excluded_regardless_of_status() {
        assert!(!task_with(TaskStatus::Pending, false).eligible());
        assert!(!task_with(TaskStatus::Error, false).eligible());
    }

    #[test]
    fn eligible_indices_preserve_queue_order() {
        let tasks = vec![
            task_with(TaskStatus::Done, true),
            task_with(TaskStatus::Pending, true),
            task_with(TaskStatus::Pending, false),
            task_with(TaskStatus::Error, true),
        ];
        assert_eq!(eligible_indices(&tasks), vec![1, 3]);
    }

    #[test]
    fn status_transitions_keep_result_and_error_consistent() {
        let mut task = BatchTask::new("data:image/png;base64,AAAA");
        task.mark_processing();
        assert_eq!(task.status, TaskStatus::Processing);

        task.mark_error("timed out");
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error.as_deref(), Some("timed out"));

        task.mark_processing();
        assert_eq!(task.error, None);

        task.mark_done("data:image/png;base64,QkJC");
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.result.as_deref(), Some("data:image/png;base64,QkJC"));
        assert_eq!(task.error, None);

        task.reset_for_regenerate();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.result, None);
    }

    #[test]
    fn percent_rounds_to_nearest_integer() {
        let mut progress = BatchProgress::new(3);
        assert_eq!(progress.percent(), 0);
        progress.completed = 1;
        assert_eq!(progress.percent(), 33);
        progress.completed = 2;
        assert_eq!(progress.percent(), 67);
        progress.completed = 3;
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn empty_run_reports_zero_percent() {
        assert_eq!(BatchProgress::new(0).percent(), 0);
    }
}
