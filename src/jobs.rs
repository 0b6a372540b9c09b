//! Entity update jobs
//!
//! Each frame runs two stages over every entity of the [`World`]: `update`
//! then `late_update`. A stage is split into batches processed on scoped
//! worker threads and returns only once every batch finished, so the next
//! stage (and rendering) never overlaps with it.

use crate::scene::{Entity, FrameParams, World};

/// Entity count below which a stage runs on the calling thread
const PARALLEL_THRESHOLD: usize = 8;

/// Stage of the per-frame entity update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Update,
    LateUpdate,
}

impl Stage {
    pub const ORDER: [Stage; 2] = [Stage::Update, Stage::LateUpdate];

    fn run(&self, entity: &dyn Entity, frame: &FrameParams) {
        match self {
            Stage::Update => entity.update(frame),
            Stage::LateUpdate => entity.late_update(frame),
        }
    }
}

/// Dispatches entity stages across worker threads
#[derive(Debug, Clone)]
pub struct JobSystem {
    workers: usize,
}

impl JobSystem {
    /// `workers` of 0 uses the available parallelism
    pub fn new(workers: usize) -> Self {
        let workers = if workers > 0 {
            workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };
        log::debug!("Job system with {workers} workers");
        Self { workers }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `stage` for every entity and wait for all of them
    ///
    /// Returns the number of entities processed.
    pub fn run(&self, stage: Stage, world: &World, frame: &FrameParams) -> usize {
        let entities: Vec<&dyn Entity> = world.entities().collect();
        let count = entities.len();
        if count == 0 {
            return 0;
        }

        if self.workers <= 1 || count < PARALLEL_THRESHOLD {
            for entity in &entities {
                stage.run(*entity, frame);
            }
            return count;
        }

        let batch_size = count.div_ceil(self.workers).max(1);
        std::thread::scope(|scope| {
            for chunk in entities.chunks(batch_size) {
                scope.spawn(move || {
                    for entity in chunk {
                        stage.run(*entity, frame);
                    }
                });
            }
        });
        log::trace!("{stage:?} ran over {count} entities");
        count
    }

    /// Both stages in order
    pub fn run_frame(&self, world: &World, frame: &FrameParams) {
        for stage in Stage::ORDER {
            self.run(stage, world, frame);
        }
    }
}

impl Default for JobSystem {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use glam::Mat4;

    use crate::scene::DynamicDrawCall;

    /// Counts its calls and fails loudly if late update runs before update
    struct StageCounter {
        name: String,
        updates: AtomicUsize,
        finished_updates: Arc<AtomicUsize>,
        total: usize,
    }

    impl Entity for StageCounter {
        fn name(&self) -> &str {
            &self.name
        }

        fn update(&self, _frame: &FrameParams) {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.finished_updates.fetch_add(1, Ordering::SeqCst);
        }

        fn late_update(&self, frame: &FrameParams) {
            assert_eq!(self.finished_updates.load(Ordering::SeqCst), self.total);
            frame
                .dynamic_draws
                .push(DynamicDrawCall::lines(&self.name, Mat4::IDENTITY, &[], glam::Vec3::ONE));
        }
    }

    fn world_of(total: usize) -> (World, Arc<AtomicUsize>) {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut world = World::new();
        for i in 0..total {
            world.spawn(StageCounter {
                name: format!("counter {i}"),
                updates: AtomicUsize::new(0),
                finished_updates: finished.clone(),
                total,
            });
        }
        (world, finished)
    }

    #[test]
    fn late_update_starts_after_every_update() {
        let (world, finished) = world_of(64);
        let frame = FrameParams::new();
        JobSystem::new(4).run_frame(&world, &frame);
        assert_eq!(finished.load(Ordering::SeqCst), 64);
        assert_eq!(frame.dynamic_draws.len(), 64);
    }

    #[test]
    fn single_worker_runs_inline() {
        let (world, _) = world_of(3);
        let frame = FrameParams::new();
        let jobs = JobSystem::new(1);
        assert_eq!(jobs.run(Stage::Update, &world, &frame), 3);
        assert_eq!(jobs.run(Stage::LateUpdate, &world, &frame), 3);
        assert_eq!(frame.dynamic_draws.len(), 3);
    }

    #[test]
    fn empty_world_is_a_no_op() {
        let frame = FrameParams::new();
        assert_eq!(JobSystem::new(2).run(Stage::Update, &World::new(), &frame), 0);
        assert!(JobSystem::default().workers() >= 1);
    }
}
