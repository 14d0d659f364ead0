use std::path::Path;
use std::process::Command;
use walkdir::WalkDir;

fn main() {
    let shader_dir = Path::new("assets/shaders");

    // Rerun when any shader source or this script changes.
    println!("cargo:rerun-if-changed=assets/shaders/");
    println!("cargo:rerun-if-changed=build.rs");

    if !shader_dir.exists() {
        println!(
            "cargo:warning=Shader directory {:?} not found, skipping SPIR-V compilation.",
            shader_dir
        );
        return;
    }

    for entry in WalkDir::new(shader_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let source_path = entry.path();
        let Some(extension_str) = source_path.extension().and_then(|s| s.to_str()) else {
            continue;
        };
        if extension_str != "vert" && extension_str != "frag" {
            continue;
        }
        let Some(source_filename) = source_path.file_name().and_then(|s| s.to_str()) else {
            println!(
                "cargo:warning=Skipping shader with non UTF-8 name: {:?}",
                source_path
            );
            continue;
        };

        // e.g. composite.frag -> composite.frag.spv
        let output_path = shader_dir.join(format!("{}.spv", source_filename));

        // The library and its tests never read SPIR-V, so a missing glslc only breaks the demo.
        match Command::new("glslc")
            .arg(source_path)
            .arg("-o")
            .arg(&output_path)
            .status()
        {
            Ok(status) if status.success() => {}
            Ok(status) => println!(
                "cargo:warning=Failed to compile shader {:?}. glslc exited with code: {:?}",
                source_path,
                status.code()
            ),
            Err(e) => println!(
                "cargo:warning=Failed to execute glslc for {:?}: {}. Is glslc on PATH?",
                source_path, e
            ),
        }
    }
}
