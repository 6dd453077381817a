//! A lock-step runner for detecting data-races and race-conditions.

use std::{
    cell::RefCell,
    hint,
    panic,
    sync::{Arc, atomic::{AtomicBool, AtomicUsize, Ordering}},
    thread::{self, JoinHandle},
};

/// Lockstep runs a serie of steps on N threads, each thread owning one instance of a Local state, and all sharing a
/// single Global state.
///
/// Every thread waits for all others before starting a step, hence the i-th step of each thread starts at about the
/// same time. Would a thread panic, all others abort at their next rendez-vous, and `join` resumes the first panic
/// collected.
///
/// Constructing a `Lockstep` is done through a `LockstepBuilder`.
pub struct Lockstep<Global, Local> {
    global: Arc<Global>,
    threads: RefCell<Vec<JoinHandle<Local>>>,
    results: RefCell<Vec<Local>>,
}

impl<Global, Local> Lockstep<Global, Local> {
    /// Joins the threads, and collects their Local states.
    ///
    /// #   Panics
    ///
    /// If any of the threads panicked, with the payload of the first one.
    pub fn join(&self) {
        let threads = self.threads.replace(vec!());

        if threads.is_empty() {
            return;
        }

        let mut results = vec!();
        let (mut failure, mut poisoned) = (None, None);

        for handle in threads {
            match handle.join() {
                Ok(local) => results.push(local),
                Err(payload) if payload.is::<Poisoned>() => { poisoned.get_or_insert(payload); },
                Err(payload) => { failure.get_or_insert(payload); },
            }
        }

        if let Some(payload) = failure.or(poisoned) {
            panic::resume_unwind(payload);
        }

        self.results.replace(results);
    }

    /// Returns a reference to the Global state.
    ///
    /// #   Warning
    ///
    /// The threads are _not_ joined first.
    pub fn global(&self) -> &Global { &self.global }

    /// Joins the threads, then returns the Global state.
    pub fn into_global(self) -> Arc<Global> {
        self.join();

        self.global.clone()
    }

    /// Joins the threads, then returns a clone of the Local states, in the order they were supplied.
    pub fn locals(&self) -> Vec<Local>
        where
            Local: Clone,
    {
        self.join();

        self.results.borrow().clone()
    }
}

impl<Global, Local> Drop for Lockstep<Global, Local> {
    fn drop(&mut self) {
        //  Never panic while unwinding.
        if thread::panicking() {
            return;
        }

        self.join();
    }
}

/// LockstepBuilder, a builder for a `Lockstep` instance.
///
/// #   Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use ultmem_test::LockstepBuilder;
///
/// let mut builder = LockstepBuilder::new(AtomicUsize::new(0), vec!(1, 10));
///
/// builder.add_step(|| |global: &AtomicUsize, local: &mut usize| { global.fetch_add(*local, Ordering::Relaxed); });
///
/// let lockstep = builder.launch(4);
///
/// assert_eq!(vec!(1, 10), lockstep.locals());
/// assert_eq!(44, lockstep.global().load(Ordering::Relaxed));
/// ```
pub struct LockstepBuilder<Global, Local> {
    global: Arc<Global>,
    locals: Vec<Local>,
    steps: Vec<Vec<Step<Global, Local>>>,
}

impl<Global, Local> LockstepBuilder<Global, Local>
    where
        Global: Send + Sync + 'static,
        Local: Send + 'static,
{
    /// Creates a builder, spawning one thread per Local state at launch.
    ///
    /// #   Panics
    ///
    /// If `locals` is empty.
    pub fn new(global: Global, locals: Vec<Local>) -> Self {
        assert!(!locals.is_empty(), "Cannot run in lock-step without a single thread");

        let steps = locals.iter().map(|_| vec!()).collect();

        Self { global: Arc::new(global), locals, steps, }
    }

    /// Adds a step on each thread.
    ///
    /// The step is created by invoking `factory` once for each thread.
    pub fn add_step<Factory, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> S,
            S: FnMut(&Global, &mut Local) + Send + 'static,
    {
        self.add_prepared_step(move || {
            let mut step = factory();
            (|_: &Global, _: &mut Local| (), move |global: &Global, local: &mut Local, _: ()| step(global, local))
        });
    }

    /// Adds a step on each thread, split in two.
    ///
    /// The preparation runs before the rendez-vous with the other threads, and its result is passed to the step
    /// proper; it is the place for any expensive set-up which should not delay the start of the step.
    pub fn add_prepared_step<Factory, Prep, R, S>(&mut self, mut factory: Factory)
        where
            Factory: FnMut() -> (Prep, S),
            Prep: FnMut(&Global, &mut Local) -> R + Send + 'static,
            S: FnMut(&Global, &mut Local, R) + Send + 'static,
    {
        for serie in &mut self.steps {
            let (mut prep, mut step) = factory();

            serie.push(Box::new(move |global: &Global, local: &mut Local, rendez_vous: &RendezVous| {
                let prepared = prep(global, local);

                rendez_vous.wait();

                step(global, local, prepared);
            }));
        }
    }

    /// Spawns the threads, each running its serie of steps `iterations` times.
    ///
    /// #   Panics
    ///
    /// If no step was added.
    pub fn launch(self, iterations: usize) -> Lockstep<Global, Local> {
        assert!(!self.steps[0].is_empty(), "Cannot run in lock-step without a single step");

        let rendez_vous = Arc::new(RendezVous::new(self.locals.len()));
        let mut threads = vec!();

        for (mut local, mut serie) in self.locals.into_iter().zip(self.steps) {
            let global = self.global.clone();
            let rendez_vous = rendez_vous.clone();

            threads.push(thread::spawn(move || {
                let guard = PoisonGuard(&rendez_vous);

                for _ in 0..iterations {
                    for step in &mut serie {
                        step(&global, &mut local, &rendez_vous);
                    }
                }

                //  No thread starts tearing down before all are done.
                rendez_vous.wait();

                guard.dismiss();

                local
            }));
        }

        Lockstep { global: self.global, threads: RefCell::new(threads), results: RefCell::new(vec!()) }
    }
}

//
//  Implementation
//

type Step<Global, Local> = Box<dyn FnMut(&Global, &mut Local, &RendezVous) + Send + 'static>;

//  Poisons the rendez-vous if the thread panics, so that the other threads do not wait forever.
struct PoisonGuard<'a>(&'a RendezVous);

impl<'a> PoisonGuard<'a> {
    fn dismiss(self) { std::mem::forget(self) }
}

impl<'a> Drop for PoisonGuard<'a> {
    fn drop(&mut self) { self.0.poison(); }
}

//  A reusable barrier; each completed rendez-vous bumps the generation.
struct RendezVous {
    parties: usize,
    arrived: AtomicUsize,
    generation: AtomicUsize,
    poisoned: AtomicBool,
}

impl RendezVous {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            arrived: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    fn poison(&self) { self.poisoned.store(true, Ordering::Release); }

    fn wait(&self) {
        let generation = self.generation.load(Ordering::Acquire);

        if self.arrived.fetch_add(1, Ordering::AcqRel) + 1 == self.parties {
            //  Reset before releasing, the next rendez-vous may start right away.
            self.arrived.store(0, Ordering::Relaxed);
            self.generation.fetch_add(1, Ordering::Release);
            return;
        }

        while self.generation.load(Ordering::Acquire) == generation {
            if self.poisoned.load(Ordering::Acquire) {
                Self::abandon_ship();
            }

            hint::spin_loop();
        }
    }

    #[cold]
    #[inline(never)]
    fn abandon_ship() -> ! { panic::panic_any(Poisoned) }
}

//  The payload of the threads aborting on behalf of another.
struct Poisoned;

#[cfg(test)]
mod tests {

use std::sync::Mutex;

use super::*;

//  (iteration, step, thread)
type Event = (usize, usize, usize);

#[derive(Default)]
struct Trace {
    events: Mutex<Vec<Event>>,
}

impl Trace {
    fn builder(threads: usize) -> LockstepBuilder<Trace, (usize, usize)> {
        LockstepBuilder::new(Trace::default(), (0..threads).map(|thread| (thread, 0)).collect())
    }

    //  Adds a step recording its invocations, the Local state being (thread, iteration).
    fn add_step(builder: &mut LockstepBuilder<Trace, (usize, usize)>, step: usize, last: bool) {
        builder.add_step(move || move |global: &Trace, local: &mut (usize, usize)| {
            global.events.lock().unwrap().push((local.1, step, local.0));

            if last {
                local.1 += 1;
            }
        });
    }

    fn expected(threads: usize, iterations: usize, steps: usize) -> Vec<Event> {
        let mut result = vec!();

        for i in 0..iterations {
            for s in 0..steps {
                for t in 0..threads {
                    result.push((i, s, t));
                }
            }
        }

        result
    }

    //  The order of threads within a step is unpredictable, the order of steps is not: sort by (iteration, step)
    //  first, the sort being stable the relative order is thus only changed within each step.
    fn events(&self, threads: usize) -> Vec<Event> {
        let events = self.events.lock().unwrap().clone();

        for chunk in events.chunks(threads) {
            let (iteration, step, _) = chunk[0];
            assert!(chunk.iter().all(|e| e.0 == iteration && e.1 == step), "{:?} not in lock-step", chunk);
        }

        let mut events = events;
        events.sort();
        events
    }
}

fn run(threads: usize, iterations: usize, steps: usize) {
    let mut builder = Trace::builder(threads);

    for step in 0..steps {
        Trace::add_step(&mut builder, step, step + 1 == steps);
    }

    let lockstep = builder.launch(iterations);

    let locals = lockstep.locals();
    assert_eq!((0..threads).map(|t| (t, iterations)).collect::<Vec<_>>(), locals);

    assert_eq!(Trace::expected(threads, iterations, steps), lockstep.global().events(threads));
}

#[test]
fn single_thread_single_step() { run(1, 1, 1); }

#[test]
fn single_thread_many_steps() { run(1, 3, 4); }

#[test]
fn many_threads_single_step() { run(4, 3, 1); }

#[test]
fn many_threads_many_steps() { run(4, 5, 3); }

#[test]
fn prepared_step() {
    let mut builder = LockstepBuilder::new(AtomicUsize::new(0), vec!(1usize, 2, 3));

    builder.add_prepared_step(|| (
        |_: &AtomicUsize, local: &mut usize| *local * 10,
        |global: &AtomicUsize, local: &mut usize, prepared: usize| {
            global.fetch_add(prepared, Ordering::Relaxed);
            *local += 1;
        },
    ));

    let global = builder.launch(2).into_global();

    assert_eq!(10 + 20 + 30 + 20 + 30 + 40, global.load(Ordering::Relaxed));
}

#[test]
#[should_panic(expected = "step failed")]
fn panic_propagates() {
    let mut builder = LockstepBuilder::new((), vec!(0usize, 1, 2));

    builder.add_step(|| |_: &(), local: &mut usize| {
        if *local == 1 {
            panic!("step failed");
        }
    });

    builder.add_step(|| |_: &(), _: &mut usize| ());

    builder.launch(3).join();
}

} // mod tests
