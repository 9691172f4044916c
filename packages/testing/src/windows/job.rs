use std::ptr;
use std::sync::{Mutex, MutexGuard};

use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT, JOB_OBJECT_LIMIT_JOB_MEMORY,
    JOB_OBJECT_LIMIT_PROCESS_MEMORY, JOBOBJECT_BASIC_LIMIT_INFORMATION,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
    SetInformationJobObject,
};
use windows::Win32::System::Threading::GetCurrentProcess;

/// Jobs tinker with process-specific configuration so they are mutually exclusive.
static MUTUALLY_EXCLUSIVE: Mutex<()> = Mutex::new(());

/// Represents the duration over which the current process is subject to custom job memory limits.
///
/// The limits are applied via `JobBuilder` and released when the `Job` is dropped. Note that
/// the process remains associated with the job, it simply no longer has any limits applied.
#[derive(Debug)]
pub struct Job<'a> {
    limits_active: bool,

    handle: HANDLE,

    #[expect(
        dead_code,
        reason = "we just want to keep it alive until we drop the job"
    )]
    mutex_guard: MutexGuard<'a, ()>,
}

impl Job<'_> {
    /// Starts building a new job to apply to the current process.
    #[must_use]
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }
}

impl Drop for Job<'_> {
    fn drop(&mut self) {
        // A process cannot leave a job, so cleanup means clearing every limit we set.
        // This only matters when one process executes multiple tests.

        // The system may refuse a "reset" of something that was never set.
        if self.limits_active {
            set_extended_limits(self.handle, &JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default());
        }

        // SAFETY: No safety requirements.
        unsafe {
            CloseHandle(self.handle).unwrap();
        }
    }
}

/// Configures instances of [`Job`] before creation.
#[derive(Debug, Default)]
pub struct JobBuilder {
    job_memory_limit: Option<usize>,
    process_memory_limit: Option<usize>,
}

impl JobBuilder {
    /// Creates a new job builder that will not apply any job limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the committed memory of all processes in the job, combined.
    #[must_use]
    pub fn with_job_memory_limit(mut self, bytes: usize) -> Self {
        self.job_memory_limit = Some(bytes);
        self
    }

    /// Limits the committed memory of each individual process in the job.
    #[must_use]
    pub fn with_process_memory_limit(mut self, bytes: usize) -> Self {
        self.process_memory_limit = Some(bytes);
        self
    }

    /// Creates the job object and assigns the current process to the job.
    ///
    /// Jobs for testing purposes are mutually exclusive - this function will block if there
    /// already is a job assigned to the current process (only counting jobs created by this type).
    ///
    /// There may also exist externally assigned jobs (e.g. because we are running in a container),
    /// which we ignore here. If both external and internal jobs define limits, the lowest limits
    /// will apply.
    ///
    /// # Panics
    ///
    /// Panics if anything goes wrong.
    #[must_use]
    pub fn build<'a>(self) -> Job<'a> {
        let mutex_guard = MUTUALLY_EXCLUSIVE.lock().unwrap();

        // SAFETY: No safety requirements.
        let job = unsafe { CreateJobObjectW(None, None).unwrap() };
        assert!(!job.is_invalid());

        let mut flags = JOB_OBJECT_LIMIT(0);

        if self.job_memory_limit.is_some() {
            flags |= JOB_OBJECT_LIMIT_JOB_MEMORY;
        }

        if self.process_memory_limit.is_some() {
            flags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
        }

        let limits_active = flags.0 != 0;

        if limits_active {
            let limit = JOBOBJECT_EXTENDED_LIMIT_INFORMATION {
                BasicLimitInformation: JOBOBJECT_BASIC_LIMIT_INFORMATION {
                    LimitFlags: flags,
                    ..Default::default()
                },
                JobMemoryLimit: self.job_memory_limit.unwrap_or_default(),
                ProcessMemoryLimit: self.process_memory_limit.unwrap_or_default(),
                ..Default::default()
            };

            set_extended_limits(job, &limit);
        }

        // SAFETY: No safety requirements. Handle does not need to be closed.
        let current_process = unsafe { GetCurrentProcess() };

        // SAFETY: No safety requirements.
        unsafe {
            AssignProcessToJobObject(job, current_process).unwrap();
        }

        Job {
            handle: job,
            limits_active,
            mutex_guard,
        }
    }
}

fn set_extended_limits(job: HANDLE, limit: &JOBOBJECT_EXTENDED_LIMIT_INFORMATION) {
    // SAFETY: No safety requirements as long as we pass valid inputs.
    unsafe {
        SetInformationJobObject(
            job,
            JobObjectExtendedLimitInformation,
            ptr::from_ref(limit).cast(),
            size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>()
                .try_into()
                .expect("struct of known size guaranteed to fit in u32"),
        )
        .unwrap();
    }
}
