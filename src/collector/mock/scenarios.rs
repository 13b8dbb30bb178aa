//! Pre-built mock host states.

use super::MockFs;

/// Path of the notebook document inside [`notebook_env`].
pub const DEMO_NOTEBOOK_PATH: &str = "/notebooks/demo.ipynb";

const DEMO_NOTEBOOK: &str = r##"{
  "nbformat": 4,
  "nbformat_minor": 5,
  "metadata": {},
  "cells": [
    {"cell_type": "markdown", "metadata": {}, "source": "# Demo"},
    {"cell_type": "code", "metadata": {}, "outputs": [], "source": "x = 1\n"},
    {
      "cell_type": "code",
      "metadata": {},
      "outputs": [],
      "source": ["import torch\n", "print(torch.__version__)\n"]
    }
  ]
}"##;

/// A typical notebook host: one notebook document and a conda-style
/// site-packages directory with a mix of tracked and untracked packages.
pub fn notebook_env() -> MockFs {
    let mut fs = MockFs::new();
    fs.add_file(DEMO_NOTEBOOK_PATH, DEMO_NOTEBOOK);

    let site = "/opt/conda/lib/python3.10/site-packages";
    fs.add_dir(format!("{site}/torch-2.1.0.dist-info"));
    fs.add_dir(format!("{site}/transformers-4.36.2.dist-info"));
    fs.add_dir(format!("{site}/poptorch_geometric-3.3.0.dist-info"));
    fs.add_dir(format!("{site}/numpy-1.26.0.dist-info"));
    fs.add_dir(format!("{site}/requests-2.31.0.dist-info"));
    fs
}
