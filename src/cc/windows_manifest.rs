//! Windows Side-by-Side Manifest
//!
//! Executables on Windows get an embedded (or side-by-side) manifest
//! naming the processor architecture and requesting plain invoker
//! privileges. Rpath emulation adds a dependent assembly named
//! `<exe>.dlls` pointing at the directory where prerequisite DLL
//! symlinks are collected.

/// Map the target CPU to the manifest processorArchitecture value.
pub fn processor_architecture(tcpu: &str) -> &'static str {
    match tcpu {
        "i386" | "i486" | "i586" | "i686" => "x86",
        "x86_64" => "amd64",
        _ => "*",
    }
}

/// Generate the manifest XML for an executable.
///
/// `name` is the executable leaf name (no directory); `rpath_dlls`
/// requests the `<name>.dlls` dependent-assembly used for rpath
/// emulation.
pub fn windows_manifest(name: &str, tcpu: &str, rpath_dlls: bool) -> String {
    let arch = processor_architecture(tcpu);
    let mut m = String::new();

    m.push_str("<?xml version='1.0' encoding='UTF-8' standalone='yes'?>\n");
    m.push_str(
        "<assembly xmlns='urn:schemas-microsoft-com:asm.v1' manifestVersion='1.0'>\n",
    );

    m.push_str("  <assemblyIdentity name='");
    m.push_str(name);
    m.push_str("' manifestVersion='1.0' type='win32' processorArchitecture='");
    m.push_str(arch);
    m.push_str("' version='0.0.0.0'/>\n");

    if rpath_dlls {
        m.push_str("  <dependency>\n    <dependentAssembly>\n");
        m.push_str("      <assemblyIdentity name='");
        m.push_str(name);
        m.push_str(".dlls' type='win32' processorArchitecture='");
        m.push_str(arch);
        m.push_str("' version='0.0.0.0' language='*'/>\n");
        m.push_str("    </dependentAssembly>\n  </dependency>\n");
    }

    m.push_str(
        "  <trustInfo xmlns='urn:schemas-microsoft-com:asm.v3'>\n    <security>\n      <requestedPrivileges>\n        <requestedExecutionLevel level='asInvoker' uiAccess='false'/>\n      </requestedPrivileges>\n    </security>\n  </trustInfo>\n",
    );
    m.push_str("</assembly>\n");
    m
}
