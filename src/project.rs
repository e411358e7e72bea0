//! Cooperative scheduling of a compiled project.

use std::time::Instant;

use wasmtime::{Engine, Module, Linker, Store, TypedFunc, Global, Memory, Instance, Val};

use crate::assembler::{CompiledProject, TargetRecord, TARGET_RECORD_SIZE, VARS_OFFSET};
use crate::compiler::THREAD_SLOTS_OFFSET;
use crate::host::{self, HostState};
use crate::runtime::*;
use crate::types::{dynamic_slot, ValueTag};

/// Simulates input from the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// Simulate pressing the start (green flag) button.
    /// Every flag script is restarted from the beginning, whether or not it was already running.
    Start,
    /// Simulate pressing the stop button.
    /// This stops every thread immediately.
    Stop,
}

/// Result of stepping through the execution of a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectStep {
    /// The project had running threads to execute and did so.
    Normal,
    /// There were no running threads to execute.
    Idle,
}

/// The lifecycle state of a thread, as last observed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Never started.
    Idle,
    /// Started but not yet run.
    Pending,
    /// Inside the current tick.
    Running,
    /// Suspended and waiting to be resumed by the next tick.
    Yielded,
    /// Ran to completion (or stopped itself).
    Completed,
    /// Stopped by [`Input::Stop`].
    Stopped,
}

fn link_error(e: wasmtime::Error) -> InstantiationError {
    InstantiationError::Link { diagnostic: format!("{e:?}") }
}
fn exec_error(e: wasmtime::Error) -> ExecError {
    match e.downcast_ref::<wasmtime::Trap>() {
        Some(trap) => ExecError::Trap { diagnostic: format!("{trap}: {e:?}") },
        None => ExecError::Trap { diagnostic: format!("{e:?}") },
    }
}

/// A compiled project instantiated and ready to run.
#[derive(Educe)]
#[educe(Debug)]
pub struct Project<S: System> {
    #[educe(Debug(ignore))]
    store: Store<HostState<S>>,
    #[educe(Debug(ignore))]
    instance: Instance,
    memory: Memory,
    #[educe(Debug(ignore))]
    tick: TypedFunc<(), ()>,
    #[educe(Debug(ignore))]
    flag_clicked: TypedFunc<(), ()>,
    #[educe(Debug(ignore))]
    stop_all: TypedFunc<(), ()>,
    active_threads: Global,
    redraw_requested: Global,
    /// Variable globals that may hold string indices.
    #[educe(Debug(ignore))]
    string_globals: Vec<Global>,
    targets_offset: u32,
    threads_offset: u32,
    thread_record_size: u32,
    target_count: usize,
    statuses: Vec<ThreadStatus>,
    settings: Settings,
}
impl<S: System> Project<S> {
    /// Validates and instantiates a compiled project, writing its string table into memory.
    pub fn new(compiled: &CompiledProject, system: S, settings: Settings) -> Result<Self, InstantiationError> {
        settings.validate()?;
        compiled.validate()?;

        let engine = Engine::default();
        let module = Module::new(&engine, &compiled.wasm).map_err(link_error)?;
        let mut linker = Linker::new(&engine);
        host::link(&mut linker).map_err(link_error)?;

        let lists = compiled.lists.iter().map(|x| x.items.clone()).collect();
        let state = HostState::new(system, compiled.target_names.clone(), lists, &settings)?;
        let mut store = Store::new(&engine, state);
        let instance = linker.instantiate(&mut store, &module).map_err(link_error)?;

        let memory = instance.get_memory(&mut store, "memory").ok_or(InstantiationError::MissingExport { name: "memory" })?;
        let mut func = |name: &'static str| instance.get_typed_func::<(), ()>(&mut store, name).map_err(|_| InstantiationError::MissingExport { name });
        let (tick, flag_clicked, stop_all) = (func("tick")?, func("flag_clicked")?, func("stop_all")?);

        let mut global = |name: &'static str| instance.get_global(&mut store, name).ok_or(InstantiationError::MissingExport { name });
        let (active_threads, redraw_requested) = (global("active_threads")?, global("redraw_requested")?);
        let mut offset = |name: &'static str| -> Result<u32, InstantiationError> {
            let global = instance.get_global(&mut store, name).ok_or(InstantiationError::MissingExport { name })?;
            global.get(&mut store).i32().map(|x| x as u32).ok_or(InstantiationError::MissingExport { name })
        };
        let (strings_offset, targets_offset, threads_offset) = (offset("strings_offset")?, offset("targets_offset")?, offset("threads_offset")?);

        host::attach(&mut store, memory, strings_offset, targets_offset, &compiled.strings)?;

        let string_globals = module.exports()
            .filter(|x| x.name().starts_with("var:") && matches!(x.ty(), wasmtime::ExternType::Global(g) if matches!(g.content(), wasmtime::ValType::I32)))
            .filter_map(|x| instance.get_global(&mut store, x.name()))
            .collect::<Vec<_>>();

        let thread_count = compiled.threads.len();
        let thread_record_size = if thread_count == 0 { 0 } else { (strings_offset - threads_offset) / thread_count as u32 };
        tracing::info!(threads = thread_count, targets = compiled.target_names.len(), strings = compiled.strings.len(), "instantiated project");

        Ok(Self {
            store, instance, memory, tick, flag_clicked, stop_all, active_threads, redraw_requested, string_globals,
            targets_offset, threads_offset, thread_record_size,
            target_count: compiled.target_names.len(),
            statuses: vec![ThreadStatus::Idle; thread_count],
            settings,
        })
    }
    pub fn system(&self) -> &S {
        &self.store.data().system
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    /// The number of threads that have not yet finished.
    pub fn active_threads(&mut self) -> u32 {
        self.active_threads.get(&mut self.store).i32().unwrap_or(0) as u32
    }
    fn redraw_requested(&mut self) -> bool {
        self.redraw_requested.get(&mut self.store).i32().unwrap_or(0) != 0
    }
    pub fn thread_statuses(&self) -> &[ThreadStatus] {
        &self.statuses
    }
    /// Reads the current state of a target, or [`None`] if there is no such target.
    pub fn target(&self, target: usize) -> Option<TargetRecord> {
        if target >= self.target_count { return None }
        let start = self.targets_offset as usize + target * TARGET_RECORD_SIZE as usize;
        self.memory.data(&self.store).get(start..).and_then(TargetRecord::decode)
    }
    /// Reads a variable held in a global; variables with a dynamic representation live in memory and are not visible here.
    pub fn global_variable(&mut self, id: &str) -> Option<Val> {
        let global = self.instance.get_global(&mut self.store, &format!("var:{id}"))?;
        Some(global.get(&mut self.store))
    }
    /// The current items of a list, by its position in [`CompiledProject::lists`].
    pub fn list(&self, list: usize) -> Option<&[Value]> {
        self.store.data().list(list)
    }
    /// The number of strings created while running that are still reachable (or not yet collected).
    pub fn runtime_strings(&self) -> usize {
        self.store.data().live_strings()
    }
    /// Frees the runtime strings nothing refers to any more.
    ///
    /// Roots are the dynamic variable slots holding strings, every scratch slot of every thread record, and the variable globals.
    /// Scratch slots are untyped, so their low words are all treated as possible string indices.
    fn collect_strings(&mut self) -> Result<(), ExecError> {
        let data = self.memory.data(&self.store);
        let word = |pos: u32| data.get(pos as usize..pos as usize + 4).and_then(|x| x.try_into().ok()).map(u32::from_le_bytes);
        let out_of_bounds = || ExecError::Memory { diagnostic: "string roots are outside of linear memory".into() };

        let mut roots = vec![];
        for slot in (VARS_OFFSET..self.targets_offset).step_by(dynamic_slot::SIZE as usize) {
            if word(slot + dynamic_slot::TAG).ok_or_else(out_of_bounds)? == ValueTag::String as u32 {
                roots.push(word(slot + dynamic_slot::PAYLOAD).ok_or_else(out_of_bounds)?);
            }
        }
        for thread in 0..self.statuses.len() as u32 {
            let record = self.threads_offset + thread * self.thread_record_size;
            for slot in (record + THREAD_SLOTS_OFFSET..record + self.thread_record_size).step_by(8) {
                roots.push(word(slot).ok_or_else(out_of_bounds)?);
            }
        }
        for global in self.string_globals.iter() {
            roots.extend(global.get(&mut self.store).i32().map(|x| x as u32));
        }

        self.store.data_mut().collect_strings(roots);
        Ok(())
    }
    fn thread_position(&self, thread: usize) -> Result<u32, ExecError> {
        let start = self.threads_offset as usize + thread * self.thread_record_size as usize;
        self.memory.data(&self.store).get(start..start + 4)
            .and_then(|x| x.try_into().ok())
            .map(u32::from_le_bytes)
            .ok_or_else(|| ExecError::Memory { diagnostic: format!("thread {thread} is outside of linear memory") })
    }

    pub fn input(&mut self, input: Input) -> Result<(), ExecError> {
        match input {
            Input::Start => {
                self.flag_clicked.call(&mut self.store, ()).map_err(exec_error)?;
                for status in self.statuses.iter_mut() {
                    *status = ThreadStatus::Pending;
                }
            }
            Input::Stop => {
                self.stop_all.call(&mut self.store, ()).map_err(exec_error)?;
                for status in self.statuses.iter_mut() {
                    if matches!(status, ThreadStatus::Pending | ThreadStatus::Running | ThreadStatus::Yielded) {
                        *status = ThreadStatus::Stopped;
                    }
                }
            }
        }
        tracing::debug!(?input, active = self.active_threads(), "input");
        Ok(())
    }
    /// Runs every active thread once.
    pub fn step(&mut self) -> Result<ProjectStep, ExecError> {
        if self.active_threads() == 0 { return Ok(ProjectStep::Idle) }

        for thread in 0..self.statuses.len() {
            if self.thread_position(thread)? != 0 {
                self.statuses[thread] = ThreadStatus::Running;
            }
        }
        self.tick.call(&mut self.store, ()).map_err(exec_error)?;
        self.collect_strings()?;
        for thread in 0..self.statuses.len() {
            if self.thread_position(thread)? != 0 {
                self.statuses[thread] = ThreadStatus::Yielded;
            } else if self.statuses[thread] == ThreadStatus::Running {
                self.statuses[thread] = ThreadStatus::Completed;
            }
        }
        Ok(ProjectStep::Normal)
    }
    /// Runs ticks until the frame budget is spent, a redraw is requested, or nothing is left to run, then draws.
    pub fn frame(&mut self) -> Result<ProjectStep, ExecError> {
        let start = Instant::now();
        let budget = self.settings.frame_budget();

        let mut res = ProjectStep::Idle;
        let mut ticks = 0usize;
        while self.active_threads() > 0 && start.elapsed() < budget && !self.redraw_requested() {
            res = self.step()?;
            ticks += 1;
        }
        tracing::trace!(ticks, elapsed = ?start.elapsed(), "frame");

        self.redraw_requested.set(&mut self.store, Val::I32(0)).map_err(exec_error)?;
        self.store.data().system.draw();
        Ok(res)
    }
    /// Runs frames until every thread has finished.
    pub fn run(&mut self) -> Result<(), RunError> {
        let start = Instant::now();
        loop {
            let frame_start = Instant::now();
            self.frame()?;
            if self.active_threads() == 0 { break }

            if let Some(timeout) = self.settings.timeout {
                let elapsed = start.elapsed();
                if elapsed >= timeout {
                    tracing::info!(?elapsed, active = self.active_threads(), "run timed out");
                    return Err(RunError::Timeout { elapsed });
                }
            }

            if !self.settings.turbo {
                match self.settings.framerate {
                    Framerate::Capped(_) => std::thread::sleep(self.settings.frame_time().saturating_sub(frame_start.elapsed())),
                    Framerate::Uncapped => self.store.data().system.await_refresh(),
                }
            }
        }
        tracing::debug!(elapsed = ?start.elapsed(), "run finished");
        Ok(())
    }
}
