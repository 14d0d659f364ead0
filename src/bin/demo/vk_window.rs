//! Window integration.

use anyhow::{Result, anyhow};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

/// Instance extensions needed to create a surface for `window`.
pub fn get_required_instance_extensions(
    window: &dyn HasWindowHandle,
) -> Result<&'static [&'static std::ffi::CStr]> {
    match window.window_handle().map(|handle| handle.as_raw()) {
        #[cfg(target_os = "linux")]
        Ok(RawWindowHandle::Wayland(_)) => {
            Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_WAYLAND_SURFACE_NAME])
        }

        #[cfg(target_os = "linux")]
        Ok(RawWindowHandle::Xcb(_)) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XCB_SURFACE_NAME]),

        #[cfg(target_os = "linux")]
        Ok(RawWindowHandle::Xlib(_)) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XLIB_SURFACE_NAME]),

        Ok(other) => Err(anyhow!("Unsupported window handle: {other:?}")),
        Err(e) => Err(anyhow!("Failed to obtain window handle: {e}")),
    }
}

/// Creates a surface for a window.
///
/// # Safety
///
/// The returned `SurfaceKHR` is only valid while the window is, so the window must outlive it.
pub unsafe fn create_surface(
    instance: &ash::Instance,
    entry: &ash::Entry,
    display: &dyn HasDisplayHandle,
    window: &dyn HasWindowHandle,
) -> Result<vk::SurfaceKHR> {
    match (
        display.display_handle().map(|handle| handle.as_raw()),
        window.window_handle().map(|handle| handle.as_raw()),
    ) {
        #[cfg(target_os = "linux")]
        (Ok(RawDisplayHandle::Wayland(display)), Ok(RawWindowHandle::Wayland(window))) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            let wayland_instance = ash::khr::wayland_surface::Instance::new(entry, instance);
            // SAFETY: display and surface pointers come from a live winit window.
            Ok(unsafe { wayland_instance.create_wayland_surface(&info, None)? })
        }

        #[cfg(target_os = "linux")]
        (Ok(RawDisplayHandle::Xcb(display)), Ok(RawWindowHandle::Xcb(window))) => {
            let connection_ptr = display
                .connection
                .map(|connection| connection.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XcbSurfaceCreateInfoKHR::default()
                .connection(connection_ptr)
                .window(window.window.get());
            let xcb_instance = ash::khr::xcb_surface::Instance::new(entry, instance);
            // SAFETY: the connection and window id come from a live winit window.
            Ok(unsafe { xcb_instance.create_xcb_surface(&info, None)? })
        }

        #[cfg(target_os = "linux")]
        (Ok(RawDisplayHandle::Xlib(display)), Ok(RawWindowHandle::Xlib(window))) => {
            let display_ptr = display
                .display
                .map(|display| display.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(display_ptr as *mut _)
                .window(window.window);
            let xlib_instance = ash::khr::xlib_surface::Instance::new(entry, instance);
            // SAFETY: the display pointer and XID come from a live winit window.
            Ok(unsafe { xlib_instance.create_xlib_surface(&info, None)? })
        }

        (display, window) => Err(anyhow!(
            "Unsupported display/window handle pair: {:?} / {:?}",
            display.map(|d| format!("{d:?}")),
            window.map(|w| format!("{w:?}"))
        )),
    }
}
