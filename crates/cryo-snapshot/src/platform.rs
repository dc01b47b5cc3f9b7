use crate::Result;

/// Which side of the snapshot jump execution is on. The saved register
/// set forces the architecture code to return to the same instruction in
/// both scenarios; this value is how the caller tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSide {
    /// The snapshot has just been taken; next step is writing it out.
    Snapshotting,
    /// The kernel has just been restored; next step is post-restore
    /// unwinding.
    Resuming,
}

/// Device-suspend phases: bus drivers first, system devices once
/// interrupts are off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendPhase {
    One,
    Two,
}

/// Everything the engine asks of the host platform: the process freezer,
/// device power management, CPU hotplug, IRQ control, firmware
/// preparation, and the architecture-level snapshot and restore jumps.
///
/// Fallible operations return `Refused`-class errors; their effects must
/// be self-undone up to the point of failure (a failed device suspend
/// leaves only still-suspended devices for `resume_devices` to handle).
pub trait Platform {
    /// Try to take the system-wide PM mutex. `false` means another PM
    /// operation is in flight.
    fn try_pm_mutex(&mut self) -> bool;
    fn release_pm_mutex(&mut self);

    fn freeze_tasks(&mut self) -> Result<()>;
    fn thaw_tasks(&mut self);

    fn platform_begin(&mut self) -> Result<()>;
    fn platform_end(&mut self);

    fn suspend_console(&mut self) -> Result<()>;
    fn resume_console(&mut self);

    fn suspend_devices(&mut self, phase: SuspendPhase) -> Result<()>;
    fn resume_devices(&mut self, phase: SuspendPhase);

    fn arch_prepare(&mut self) -> Result<()>;
    fn arch_cleanup(&mut self);

    /// The device-PM lock taken for the innermost part of the atomic
    /// region.
    fn pm_lock(&mut self) -> Result<()>;
    fn pm_unlock(&mut self);

    fn disable_nonboot_cpus(&mut self) -> Result<()>;
    fn enable_nonboot_cpus(&mut self);

    fn irq_disable(&mut self);
    fn irq_enable(&mut self);

    fn power_down_devices(&mut self) -> Result<()>;
    fn power_up_devices(&mut self);

    /// Save the CPU context so the snapshot jump can return twice.
    fn save_cpu_context(&mut self) -> Result<()>;

    /// The architecture snapshot jump. `post_context_save` is the
    /// engine's atomic-copy work; it runs on the suspended side, after
    /// the register state has been captured. Returns which side execution
    /// continues on.
    fn snapshot_jump(
        &mut self,
        post_context_save: &mut dyn FnMut() -> Result<()>,
    ) -> Result<SnapshotSide>;

    /// The architecture restore trampoline. `copyback` overwrites every
    /// original frame from its copy; on real hardware this call does not
    /// return on success; control reappears at the snapshot jump in the
    /// restored kernel.
    fn restore_jump(&mut self, copyback: &mut dyn FnMut() -> Result<()>) -> Result<()>;

    fn power_off(&mut self) -> Result<()>;
    fn reboot(&mut self) -> Result<()>;

    fn cpu_count(&self) -> u32 {
        1
    }

    fn os_version(&self) -> &str {
        "unknown"
    }

    fn root_device(&self) -> u32 {
        0
    }
}
