//! Build script for the CUDA cache shim.
//!
//! libtorch's caching allocator is only reachable through C++, so a small
//! shim (`src/cuda_cache.cpp`) is compiled against the libtorch headers when
//! the `tch-backend` feature is on and a CUDA build of libtorch plus the CUDA
//! toolkit headers are present. The `cuda_cache` cfg tells the crate the
//! shim was linked; without it clearing the cache falls back to a device sync.

use std::{
    env,
    path::{Path, PathBuf},
};

fn main() {
    println!("cargo:rustc-check-cfg=cfg(cuda_cache)");
    println!("cargo:rerun-if-changed=src/cuda_cache.cpp");
    println!("cargo:rerun-if-env-changed=LIBTORCH");
    println!("cargo:rerun-if-env-changed=CUDA_HOME");

    if env::var_os("CARGO_FEATURE_TCH_BACKEND").is_none() {
        return;
    }

    let Some(libtorch) = libtorch_root() else {
        println!("cargo:warning=libtorch not located, CUDA cache release disabled");
        return;
    };
    let allocator_header = libtorch.join("include/c10/cuda/CUDACachingAllocator.h");
    if !allocator_header.exists() {
        // CPU-only libtorch.
        return;
    }
    let Some(cuda) = cuda_root() else {
        println!("cargo:warning=CUDA toolkit headers not found, CUDA cache release disabled");
        return;
    };

    let abi = env::var("LIBTORCH_CXX11_ABI").unwrap_or_else(|_| "1".to_string());
    cc::Build::new()
        .cpp(true)
        .file("src/cuda_cache.cpp")
        .include(libtorch.join("include"))
        .include(libtorch.join("include/torch/csrc/api/include"))
        .include(cuda.join("include"))
        .flag_if_supported("-std=c++17")
        .define("_GLIBCXX_USE_CXX11_ABI", abi.as_str())
        .warnings(false)
        .compile("cuda_cache");

    println!("cargo:rustc-link-search=native={}", libtorch.join("lib").display());
    println!("cargo:rustc-link-lib=c10_cuda");
    println!("cargo:rustc-link-lib=c10");
    println!("cargo:rustc-cfg=cuda_cache");
}

/// `LIBTORCH` when set, otherwise the copy torch-sys downloaded or found.
fn libtorch_root() -> Option<PathBuf> {
    if let Some(dir) = env::var_os("LIBTORCH") {
        return Some(PathBuf::from(dir));
    }
    env::var_os("DEP_TCH_LIBTORCH_LIB")
        .map(PathBuf::from)
        .and_then(|lib| lib.parent().map(Path::to_path_buf))
}

fn cuda_root() -> Option<PathBuf> {
    ["CUDA_HOME", "CUDA_PATH"]
        .into_iter()
        .filter_map(env::var_os)
        .map(PathBuf::from)
        .chain([PathBuf::from("/usr/local/cuda")])
        .find(|dir| dir.join("include/cuda_runtime_api.h").exists())
}
