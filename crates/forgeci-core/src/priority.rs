//! Queue priority classes.
//!
//! Lower values are more urgent. A job's priority is assigned exactly once
//! when it is enqueued and is never mutated afterwards.

use serde::{Deserialize, Serialize};

/// The queue priority of a build job. Lower = more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub i32);

impl Priority {
    /// A submission made inside an active exam conduction window.
    pub const EXAM_CONDUCTION: Priority = Priority(1);

    /// Test exams and exam test-runs while the exam is in progress.
    pub const EXAM_ELEVATED: Priority = Priority(2);

    /// Regular course submissions.
    pub const NORMAL: Priority = Priority(3);

    /// Exercises that are not included in the course score.
    pub const UNGRADED: Priority = Priority(4);

    /// Practice-mode submissions after the exercise due date.
    pub const PRACTICE: Priority = Priority(5);

    /// Instructor-requested "build all participations" runs.
    pub const BUILD_ALL: Priority = Priority(6);

    /// Added to any priority when the owning course is flagged as a test
    /// course, so that sandbox traffic queues behind real courses.
    pub const TEST_COURSE_PENALTY: i32 = 10;

    pub fn with_test_course_penalty(self) -> Priority {
        Priority(self.0 + Self::TEST_COURSE_PENALTY)
    }

    pub fn value(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
