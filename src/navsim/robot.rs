//! Simulated differential-drive robot.
//!
//! Motion is a straight-line interpolation from the start pose to the
//! target in fixed steps, paced by the configured linear speed. A newer
//! goal or a cancel preempts the running one.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

/// Interpolation steps per goal.
const STEPS: u32 = 20;

/// Distance at which a goal counts as reached (m).
const POSITION_TOLERANCE: f64 = 0.1;

/// Pause at each waypoint.
const DEFAULT_DWELL: Duration = Duration::from_millis(500);

// ─── Pose ────────────────────────────────────────────────────────────────────

/// Planar pose in the map frame (m, m, rad).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub yaw: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }

    pub fn distance_to(&self, other: &Pose) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    fn lerp(&self, to: &Pose, t: f64) -> Pose {
        Pose {
            x: self.x + (to.x - self.x) * t,
            y: self.y + (to.y - self.y) * t,
            yaw: self.yaw + (to.yaw - self.yaw) * t,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.yaw.is_finite()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "x": self.x,
            "y": self.y,
            "yaw": self.yaw,
            "yaw_deg": self.yaw.to_degrees(),
        })
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NavStatus {
    Idle,
    Navigating,
    Succeeded,
    Failed,
    Canceled,
}

/// Result of one goal.
#[derive(Debug, Clone, Serialize)]
pub struct NavOutcome {
    pub success: bool,
    pub status: NavStatus,
    pub message: String,
    /// Straight-line distance of the goal (m).
    pub distance: f64,
    /// Wall time spent driving (s).
    pub time: f64,
    pub pose: Pose,
}

/// Why a goal was refused before the robot moved.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GoalError {
    #[error("Unknown location: {name}")]
    UnknownLocation { name: String, known: Vec<String> },

    #[error("Goal ({x}, {y}) is out of reach: {distance} m at {speed} m/s")]
    OutOfReach {
        x: f64,
        y: f64,
        distance: f64,
        speed: f64,
    },
}

/// Result of a waypoint run.
#[derive(Debug, Clone, Serialize)]
pub struct WaypointReport {
    pub success: bool,
    pub completed: Vec<usize>,
    pub failed: Vec<usize>,
    pub total: usize,
}

// ─── Robot ───────────────────────────────────────────────────────────────────

/// Shared handle to the simulated robot.
#[derive(Debug, Clone)]
pub struct Robot {
    state: Arc<Mutex<RobotState>>,
    speed: f64,
    dwell: Duration,
}

#[derive(Debug)]
struct RobotState {
    pose: Pose,
    target: Option<Pose>,
    status: NavStatus,
    /// Bumped by every new goal and every cancel; a driver whose goal
    /// number no longer matches has been preempted.
    goal_seq: u64,
    progress: f64,
    started_at: Option<Instant>,
    estimated_secs: f64,
    locations: BTreeMap<String, Pose>,
}

impl Robot {
    /// A robot at the origin moving at `speed` m/s.
    pub fn new(speed: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(RobotState {
                pose: Pose::default(),
                target: None,
                status: NavStatus::Idle,
                goal_seq: 0,
                progress: 0.0,
                started_at: None,
                estimated_secs: 0.0,
                locations: default_locations(),
            })),
            speed: if speed > 0.0 { speed } else { 0.5 },
            dwell: DEFAULT_DWELL,
        }
    }

    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    /// Drive to `target`. With `wait == false` the goal runs in the
    /// background and the returned outcome reports it as started.
    ///
    /// A goal whose travel time cannot be paced is refused and leaves the
    /// current goal untouched.
    pub async fn navigate_to(&self, target: Pose, wait: bool) -> Result<NavOutcome, GoalError> {
        let (seq, start, step_delay) = {
            let mut state = self.state.lock().await;
            let distance = state.pose.distance_to(&target);
            let step_delay = self.step_delay(distance).ok_or(GoalError::OutOfReach {
                x: target.x,
                y: target.y,
                distance,
                speed: self.speed,
            })?;
            state.goal_seq += 1;
            state.target = Some(target);
            state.status = NavStatus::Navigating;
            state.progress = 0.0;
            state.started_at = Some(Instant::now());
            state.estimated_secs = state.pose.distance_to(&target) / self.speed;
            (state.goal_seq, state.pose, step_delay)
        };

        let distance = start.distance_to(&target);
        tracing::info!(
            from_x = start.x,
            from_y = start.y,
            to_x = target.x,
            to_y = target.y,
            distance,
            "navigation started"
        );

        if !wait {
            let robot = self.clone();
            tokio::spawn(async move {
                robot.drive(seq, start, target, step_delay).await;
            });
            return Ok(NavOutcome {
                success: true,
                status: NavStatus::Navigating,
                message: "Navigation started".to_string(),
                distance,
                time: 0.0,
                pose: start,
            });
        }

        Ok(self.drive(seq, start, target, step_delay).await)
    }

    /// Drive to a named location.
    pub async fn navigate_to_location(
        &self,
        name: &str,
        wait: bool,
    ) -> Result<NavOutcome, GoalError> {
        let target = {
            let state = self.state.lock().await;
            match state.locations.get(name) {
                Some(pose) => *pose,
                None => {
                    return Err(GoalError::UnknownLocation {
                        name: name.to_string(),
                        known: state.locations.keys().cloned().collect(),
                    })
                }
            }
        };
        self.navigate_to(target, wait).await
    }

    /// Visit each waypoint in order. Without `keep_going` the run stops at
    /// the first failed waypoint.
    pub async fn navigate_waypoints(&self, waypoints: &[Pose], keep_going: bool) -> WaypointReport {
        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for (i, wp) in waypoints.iter().enumerate() {
            tracing::debug!(index = i, total = waypoints.len(), "waypoint");
            let reached = match self.navigate_to(*wp, true).await {
                Ok(outcome) => outcome.success,
                Err(e) => {
                    tracing::warn!(index = i, error = %e, "waypoint refused");
                    false
                }
            };
            if reached {
                completed.push(i);
            } else {
                failed.push(i);
                if !keep_going {
                    break;
                }
            }
            if i + 1 < waypoints.len() {
                tokio::time::sleep(self.dwell).await;
            }
        }

        WaypointReport {
            success: failed.is_empty() && completed.len() == waypoints.len(),
            completed,
            failed,
            total: waypoints.len(),
        }
    }

    /// Cancel the active goal. Returns `false` when nothing was running.
    pub async fn cancel(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status != NavStatus::Navigating {
            return false;
        }
        state.goal_seq += 1;
        state.status = NavStatus::Canceled;
        tracing::info!("navigation canceled");
        true
    }

    pub async fn status(&self) -> Value {
        let state = self.state.lock().await;
        let elapsed = state
            .started_at
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let remaining = state
            .target
            .map(|t| state.pose.distance_to(&t))
            .unwrap_or(0.0);

        json!({
            "status": state.status,
            "current_pose": state.pose.to_json(),
            "target_pose": state.target.map(|t| t.to_json()),
            "distance_remaining": remaining,
            "navigation_time": elapsed,
            "estimated_time_remaining": (state.estimated_secs - elapsed).max(0.0),
            "progress": state.progress * 100.0,
        })
    }

    /// Relocalise. Any active goal is abandoned.
    pub async fn set_initial_pose(&self, pose: Pose) {
        let mut state = self.state.lock().await;
        if state.status == NavStatus::Navigating {
            state.goal_seq += 1;
            state.status = NavStatus::Canceled;
        }
        state.pose = pose;
        tracing::info!(x = pose.x, y = pose.y, yaw = pose.yaw, "initial pose set");
    }

    pub async fn pose(&self) -> Pose {
        self.state.lock().await.pose
    }

    pub async fn locations(&self) -> BTreeMap<String, Pose> {
        self.state.lock().await.locations.clone()
    }

    pub async fn add_location(&self, name: &str, pose: Pose) {
        self.state
            .lock()
            .await
            .locations
            .insert(name.to_string(), pose);
        tracing::info!(name, x = pose.x, y = pose.y, "location added");
    }

    /// Pause between interpolation steps, or `None` when the travel time
    /// does not fit in a `Duration`.
    fn step_delay(&self, distance: f64) -> Option<Duration> {
        Duration::try_from_secs_f64(distance / self.speed / f64::from(STEPS)).ok()
    }

    async fn drive(&self, seq: u64, start: Pose, target: Pose, step_delay: Duration) -> NavOutcome {
        let distance = start.distance_to(&target);
        let began = Instant::now();

        for step in 1..=STEPS {
            tokio::time::sleep(step_delay).await;

            let mut state = self.state.lock().await;
            if state.goal_seq != seq {
                let pose = state.pose;
                return NavOutcome {
                    success: false,
                    status: NavStatus::Canceled,
                    message: "Navigation was canceled".to_string(),
                    distance: start.distance_to(&pose),
                    time: began.elapsed().as_secs_f64(),
                    pose,
                };
            }
            let t = f64::from(step) / f64::from(STEPS);
            state.pose = start.lerp(&target, t);
            state.progress = t;
        }

        let mut state = self.state.lock().await;
        let reached = state.pose.distance_to(&target) <= POSITION_TOLERANCE;
        state.status = if reached {
            NavStatus::Succeeded
        } else {
            NavStatus::Failed
        };
        let time = began.elapsed().as_secs_f64();
        tracing::info!(reached, time, "navigation finished");

        NavOutcome {
            success: reached,
            status: state.status,
            message: if reached {
                "Navigation completed successfully".to_string()
            } else {
                "Navigation failed".to_string()
            },
            distance,
            time,
            pose: state.pose,
        }
    }
}

fn default_locations() -> BTreeMap<String, Pose> {
    [
        ("kitchen", Pose::new(2.5, 1.0, 0.0)),
        ("living_room", Pose::new(5.0, 3.0, 1.57)),
        ("bedroom", Pose::new(3.0, 5.0, 3.14)),
        ("charging_station", Pose::new(0.0, 0.0, 0.0)),
        ("door", Pose::new(1.5, 0.5, 1.57)),
        ("window", Pose::new(4.0, 2.0, 0.0)),
    ]
    .into_iter()
    .map(|(name, pose)| (name.to_string(), pose))
    .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_robot() -> Robot {
        Robot::new(1_000.0).with_dwell(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_navigate_to_location_reaches_target() {
        let robot = fast_robot();
        let outcome = robot.navigate_to_location("kitchen", true).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.status, NavStatus::Succeeded);
        assert!((outcome.distance - 2.5f64.hypot(1.0)).abs() < 1e-9);
        assert!(robot.pose().await.distance_to(&Pose::new(2.5, 1.0, 0.0)) < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_location_lists_known_names() {
        let robot = fast_robot();
        let err = robot.navigate_to_location("garage", true).await.unwrap_err();
        match err {
            GoalError::UnknownLocation { name, known } => {
                assert_eq!(name, "garage");
                assert!(known.contains(&"kitchen".to_string()));
                assert_eq!(known.len(), 6);
            }
            other => panic!("expected UnknownLocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_preempts_running_goal() {
        let robot = Robot::new(1.0);
        let driver = {
            let robot = robot.clone();
            tokio::spawn(async move { robot.navigate_to(Pose::new(10.0, 0.0, 0.0), true).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(robot.cancel().await);

        let outcome = driver.await.unwrap().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.status, NavStatus::Canceled);
        assert!(!robot.cancel().await, "nothing left to cancel");
    }

    #[tokio::test]
    async fn test_background_goal_returns_immediately() {
        let robot = Robot::new(1.0);
        let outcome = robot.navigate_to(Pose::new(5.0, 0.0, 0.0), false).await.unwrap();
        assert_eq!(outcome.status, NavStatus::Navigating);
        assert_eq!(robot.status().await["status"], "NAVIGATING");
        assert!(robot.cancel().await);
    }

    #[tokio::test]
    async fn test_waypoints_visit_in_order() {
        let robot = fast_robot();
        let report = robot
            .navigate_waypoints(&[Pose::new(1.0, 0.0, 0.0), Pose::new(1.0, 1.0, 0.0)], false)
            .await;
        assert!(report.success);
        assert_eq!(report.completed, vec![0, 1]);
        assert_eq!(robot.pose().await, Pose::new(1.0, 1.0, 0.0));
    }

    #[tokio::test]
    async fn test_added_location_is_navigable() {
        let robot = fast_robot();
        robot.add_location("dock", Pose::new(-1.0, 2.0, 0.0)).await;
        assert!(robot.locations().await.contains_key("dock"));
        assert!(robot.navigate_to_location("dock", true).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_status_reports_pose_in_degrees() {
        let robot = fast_robot();
        robot.set_initial_pose(Pose::new(1.0, 2.0, std::f64::consts::PI)).await;
        let status = robot.status().await;
        assert_eq!(status["status"], "IDLE");
        assert!((status["current_pose"]["yaw_deg"].as_f64().unwrap() - 180.0).abs() < 1e-9);
        assert!(status["target_pose"].is_null());
    }

    #[tokio::test]
    async fn test_far_goal_is_refused_without_moving() {
        let robot = Robot::new(0.5);
        let err = robot
            .navigate_to(Pose::new(1e300, 0.0, 0.0), true)
            .await
            .unwrap_err();
        assert!(matches!(err, GoalError::OutOfReach { .. }));
        assert_eq!(robot.pose().await, Pose::default());
        assert_eq!(robot.status().await["status"], "IDLE");
    }

    #[tokio::test]
    async fn test_far_location_is_refused() {
        let robot = fast_robot();
        robot.set_initial_pose(Pose::new(-1e300, 0.0, 0.0)).await;
        let err = robot.navigate_to_location("kitchen", false).await.unwrap_err();
        assert!(matches!(err, GoalError::OutOfReach { .. }));
    }

    #[tokio::test]
    async fn test_far_waypoint_counts_as_failed() {
        let robot = fast_robot();
        let report = robot
            .navigate_waypoints(&[Pose::new(1e300, 0.0, 0.0), Pose::new(1.0, 0.0, 0.0)], true)
            .await;
        assert!(!report.success);
        assert_eq!(report.failed, vec![0]);
        assert_eq!(report.completed, vec![1]);
    }
}
